//! Driver configuration (SPEC_FULL's ambient-stack "Configuration" section):
//! a plain struct built programmatically by the embedder and handed to
//! [`crate::driver`] at thread-spawn time. No file or environment parsing
//! lives here — that is explicitly out of scope per spec.md §1.

/// Grounded on the teacher's `aero-cpu-core::jit::runtime::JitConfig`
/// (`hot_threshold`, `cache_max_blocks`); extended with the per-block
/// budget fields spec.md §4.2/§4.3 name (`max_instructions`, node count)
/// and the §4.3 segment-telemetry toggle.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Upper bound on guest instructions decoded into a single block
    /// (spec.md §4.2 `decode_block`'s `max_instructions` parameter).
    pub max_instructions_per_block: usize,
    /// Upper bound on IR nodes a single block's lowering may emit before
    /// the driver gives up and forces a synthesized exit; guards against
    /// pathological expansion (e.g. REP-prefixed string ops with a huge
    /// static count are still one `MemCpy`/`MemSet` node, but a long
    /// straight-line block of SHLD/RCR cascades can still grow large).
    pub max_ir_nodes_per_block: usize,
    /// Whether the front end emits the segment-escape telemetry bitmap
    /// described in spec.md §4.3 (FS/GS-base-vs-selector tracking). Off by
    /// default since it is a diagnostics aid, not required for
    /// correctness.
    pub enable_segment_telemetry_check: bool,
    /// Maximum number of resident entries in the block cache before the
    /// LRU policy starts evicting (spec.md §4.5 "Block cache").
    pub cache_capacity: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_instructions_per_block: 256,
            max_ir_nodes_per_block: 4096,
            enable_segment_telemetry_check: false,
            cache_capacity: 4096,
        }
    }
}
