//! The block cache (spec.md §4.5 "Block cache", §6 "Block header").
//!
//! Grounded on the teacher's `aero-cpu-core::jit::cache::{CodeCache,
//! CompiledBlockHandle, CompiledBlockMeta}` (see
//! `aero-cpu-core/tests/code_cache.rs`): a capacity-bounded map keyed by
//! guest entry PC, LRU-evicting the least recently touched entry once
//! full, `insert` returning whatever it evicted so the caller can drop any
//! chaining patchpoints that pointed at the evicted block.
//!
//! Concurrency (spec.md §4.5 "Concurrency on the cache"): inserts are
//! guarded by a short critical section, reads take a shared lock rather
//! than being genuinely lock-free — `std::sync::RwLock` stands in for the
//! lock-free published-map scheme described in spec.md, a deliberate
//! simplification noted in DESIGN.md. A flush swaps in a fresh, empty
//! cache; the old one's entries are held only as `Arc` clones by whichever
//! threads are mid-`invoke`, so the spec's quiescence barrier (deferred
//! destruction until every thread has exited translated code) falls out of
//! ordinary `Arc` refcounting rather than needing an explicit barrier
//! object.

use std::collections::HashMap;
use std::sync::Arc;

/// `DebugData`-equivalent metadata (SPEC_FULL supplemented feature 3,
/// source: `JIT/DebugData.h`): one guest-PC-to-host-offset mapping entry.
/// `host_offset` is opaque to this crate — whatever the backend's
/// `CompiledCode` interprets it as (a byte offset, an IR node index for
/// the reference interpreter backend, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDebugInfoEntry {
    pub guest_pc: u64,
    pub host_offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDebugInfo {
    pub entries: Vec<BlockDebugInfoEntry>,
}

/// The block header spec.md §6 describes as stable across runs of the
/// same host triple, plus the debug map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBlockMeta {
    pub guest_inst_count: u32,
    pub block_ref_offset: u32,
    pub debug: BlockDebugInfo,
}

/// One published cache entry: the backend's opaque compiled unit plus its
/// header. Cheap to clone regardless of how large `C` is, since the code
/// itself lives behind an `Arc`.
#[derive(Debug)]
pub struct CompiledBlockHandle<C> {
    pub entry_rip: u64,
    pub code: Arc<C>,
    pub meta: CompiledBlockMeta,
}

impl<C> Clone for CompiledBlockHandle<C> {
    fn clone(&self) -> Self {
        CompiledBlockHandle {
            entry_rip: self.entry_rip,
            code: Arc::clone(&self.code),
            meta: self.meta.clone(),
        }
    }
}

struct Entry<C> {
    handle: CompiledBlockHandle<C>,
    last_touched: u64,
}

/// Capacity-bounded, LRU-evicting map from guest entry PC to a compiled
/// block, generic over the backend's compiled-code type `C`.
pub struct CodeCache<C> {
    capacity: usize,
    clock: u64,
    entries: HashMap<u64, Entry<C>>,
}

impl<C> CodeCache<C> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        CodeCache { capacity: capacity.max(1), clock: 0, entries: HashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, entry_rip: u64) -> bool {
        self.entries.contains_key(&entry_rip)
    }

    /// Looks up `entry_rip`, touching its recency on a hit. Cheap (an
    /// `Arc` clone plus a small struct copy) by design: the caller may hold
    /// the returned handle across an `invoke` call without holding any lock
    /// on the cache itself.
    pub fn get_cloned(&mut self, entry_rip: u64) -> Option<CompiledBlockHandle<C>> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(&entry_rip)?;
        entry.last_touched = clock;
        Some(entry.handle.clone())
    }

    /// Inserts `handle`, evicting the least-recently-touched entries (by
    /// `entry_rip`) until the cache is back at or under capacity. Returns
    /// every evicted `entry_rip` so the caller can invalidate any chaining
    /// patchpoint that targeted it.
    pub fn insert(&mut self, handle: CompiledBlockHandle<C>) -> Vec<u64> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.insert(handle.entry_rip, Entry { handle, last_touched: clock });

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((&lru_rip, _)) = self.entries.iter().min_by_key(|(_, e)| e.last_touched) else {
                break;
            };
            self.entries.remove(&lru_rip);
            evicted.push(lru_rip);
        }
        evicted
    }

    /// Drops every entry whose guest address range overlaps
    /// `[addr, addr + len)`, the self-modifying-code path of spec.md §4.5
    /// ("A cache flush ... triggered by guest code self-modifying
    /// writes"). A block's range is approximated here as
    /// `[entry_rip, entry_rip + guest_inst_count)` since this crate does
    /// not track the exact byte span a block covers; a real deployment
    /// would track the true `[entry_rip, entry_rip + decoded_byte_len)`
    /// range in `CompiledBlockMeta`.
    pub fn invalidate_range(&mut self, addr: u64, len: u64) -> Vec<u64> {
        let end = addr.saturating_add(len);
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(&rip, e)| rip < end && addr < rip.saturating_add(u64::from(e.handle.meta.guest_inst_count).max(1)))
            .map(|(&rip, _)| rip)
            .collect();
        for rip in &stale {
            self.entries.remove(rip);
        }
        stale
    }

    /// Discards every entry, matching a full cache flush.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(entry_rip: u64) -> CompiledBlockHandle<u32> {
        CompiledBlockHandle {
            entry_rip,
            code: Arc::new(entry_rip as u32),
            meta: CompiledBlockMeta { guest_inst_count: 1, block_ref_offset: 0, debug: BlockDebugInfo::default() },
        }
    }

    #[test]
    fn get_cloned_updates_recency_so_inserts_evict_the_true_lru() {
        let mut cache: CodeCache<u32> = CodeCache::new(3);
        assert!(cache.insert(handle(0)).is_empty());
        assert!(cache.insert(handle(1)).is_empty());
        assert!(cache.insert(handle(2)).is_empty());

        assert!(cache.get_cloned(0).is_some());

        let evicted = cache.insert(handle(3));
        assert_eq!(evicted, vec![1]);
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn invalidate_range_drops_only_overlapping_blocks() {
        let mut cache: CodeCache<u32> = CodeCache::new(8);
        cache.insert(handle(0x1000));
        cache.insert(handle(0x2000));

        let dropped = cache.invalidate_range(0x1000, 1);
        assert_eq!(dropped, vec![0x1000]);
        assert!(!cache.contains(0x1000));
        assert!(cache.contains(0x2000));
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache: CodeCache<u32> = CodeCache::new(8);
        cache.insert(handle(0x1000));
        cache.clear();
        assert!(cache.is_empty());
    }
}
