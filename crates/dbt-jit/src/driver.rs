//! The per-thread driver loop (spec.md §4.5 "Main loop per thread"):
//! cache lookup, translate-on-miss, invoke, and fold the backend's
//! [`BlockExit`] into a returned [`ExitReason`].
//!
//! Grounded on the teacher's `aero-cpu-core::jit::runtime::JitRuntime`
//! (`install_handle`/`prepare_block`/`stats_snapshot`, see
//! `aero-cpu-core/tests/jit_bookkeeping.rs`): one `JitDriver` per guest
//! thread, each owning its backend instance and sharing a `CodeCache`
//! behind a lock.

use crate::backend::{BlockExit, GuestMemory, JitBackend, SyscallHandler};
use crate::cache::{CodeCache, CompiledBlockHandle};
use crate::config::JitConfig;
use crate::error::{ExitReason, JitError};
use dbt_decoder::DecodeMode;
use dbt_ir::validate;
use dbt_types::CpuState;
use dbt_x86::decode_and_classify_block;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Stats the driver accumulates for its own thread, mirroring the
/// teacher's `stats_snapshot` (`{cache_hit, cache_miss}`) rather than
/// inventing a new shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub cache_hit: u64,
    pub cache_miss: u64,
}

/// Cross-thread cancellation flag (spec.md §5 "Cancellation"): set from
/// any thread, observed at the next block boundary.
#[derive(Debug, Clone, Default)]
pub struct ShouldStop(Arc<AtomicBool>);

impl ShouldStop {
    #[must_use]
    pub fn new() -> Self {
        ShouldStop(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One thread's driver: owns a backend instance (matching spec.md §5's
/// "each thread owns its CPU state and IR arena") and a handle to the
/// block cache shared with every other thread translating the same
/// guest image.
pub struct JitDriver<B: JitBackend> {
    backend: B,
    cache: Arc<RwLock<CodeCache<B::CompiledCode>>>,
    should_stop: ShouldStop,
    config: JitConfig,
    mode: DecodeMode,
    stats: DriverStats,
}

impl<B: JitBackend> JitDriver<B> {
    #[must_use]
    pub fn new(
        backend: B,
        cache: Arc<RwLock<CodeCache<B::CompiledCode>>>,
        should_stop: ShouldStop,
        config: JitConfig,
        mode: DecodeMode,
    ) -> Self {
        JitDriver { backend, cache, should_stop, config, mode, stats: DriverStats::default() }
    }

    #[must_use]
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Runs translated guest code starting from `cpu.rip` until a
    /// terminal [`ExitReason`], exactly the loop spec.md §4.5 describes.
    pub fn run(&mut self, cpu: &mut CpuState, memory: &mut dyn GuestMemory, syscalls: &mut dyn SyscallHandler) -> ExitReason {
        loop {
            if self.should_stop.is_set() {
                return ExitReason::Shutdown;
            }

            let pc = cpu.rip;
            let cached = self.cache.write().expect("block cache lock poisoned").get_cloned(pc);
            let handle = match cached {
                Some(h) => {
                    self.stats.cache_hit += 1;
                    h
                }
                None => {
                    self.stats.cache_miss += 1;
                    match self.translate(pc, memory) {
                        Ok(h) => h,
                        Err(err) => return self.fail_translation(cpu, pc, err),
                    }
                }
            };

            match self.backend.invoke(&handle.code, cpu, memory, syscalls) {
                BlockExit::Normal { .. } | BlockExit::DebugStep { .. } => {}
                BlockExit::DebugTrap => return ExitReason::Debug,
                BlockExit::Shutdown => return ExitReason::Shutdown,
                BlockExit::UnknownError => return ExitReason::UnknownError,
                BlockExit::AsyncEvent => return ExitReason::AsyncEvent,
                BlockExit::Break { reason, trap_number, si_code, error_register } => {
                    return ExitReason::Break { reason, trap_number, si_code, error_register };
                }
            }
        }
    }

    /// Decode → lower → optimize → compile → publish, the cache-miss path
    /// of spec.md §4.5's pseudocode. `maybe_chain`'s patchpoint rewrite has
    /// no counterpart here: [`crate::interp::InterpreterBackend`] has no
    /// native tail branch to patch, so chaining degenerates to "the next
    /// miss finds the newly published entry instead" (documented in
    /// DESIGN.md).
    fn translate(&mut self, pc: u64, memory: &mut dyn GuestMemory) -> Result<CompiledBlockHandle<B::CompiledCode>, JitError> {
        let decoded = decode_and_classify_block(self.mode, pc, memory, self.config.max_instructions_per_block);
        if decoded.instructions.is_empty() {
            return Err(JitError::EmptyBlock(pc));
        }

        let mut function = dbt_frontend::lower_all(&decoded, pc)?;
        validate(&function)?;
        dbt_passes::run(&mut function);
        validate(&function).map_err(JitError::PostPassInvalid)?;

        let (code, meta) = self.backend.compile(&function)?;
        let handle = CompiledBlockHandle { entry_rip: pc, code: Arc::new(code), meta };
        self.cache.write().expect("block cache lock poisoned").insert(handle.clone());
        Ok(handle)
    }

    /// Translation errors are fatal to the thread (spec.md §7): write the
    /// RIP back to the block's entry (the best available approximation
    /// absent a per-instruction guest-RIP tag) and return `UnknownError`
    /// rather than unwinding as a panic.
    fn fail_translation(&self, cpu: &mut CpuState, pc: u64, err: JitError) -> ExitReason {
        tracing::error!(rip = %format_args!("{pc:#x}"), error = %err, "translation failed");
        cpu.rip = pc;
        ExitReason::UnknownError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::InterpreterBackend;
    use dbt_decoder::ByteReader;
    use dbt_types::Gpr;

    struct FlatMemory {
        bytes: Vec<u8>,
    }

    impl FlatMemory {
        fn new(code: &[u8]) -> Self {
            let mut bytes = vec![0u8; 0x10000];
            bytes[..code.len()].copy_from_slice(code);
            FlatMemory { bytes }
        }
    }

    impl ByteReader for FlatMemory {
        fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
            let addr = addr as usize;
            if addr >= self.bytes.len() {
                return 0;
            }
            let n = buf.len().min(self.bytes.len() - addr);
            buf[..n].copy_from_slice(&self.bytes[addr..addr + n]);
            n
        }
    }

    impl GuestMemory for FlatMemory {
        fn write(&mut self, addr: u64, buf: &[u8]) {
            let addr = addr as usize;
            self.bytes[addr..addr + buf.len()].copy_from_slice(buf);
        }
    }

    struct NoSyscalls;
    impl SyscallHandler for NoSyscalls {
        fn handle_syscall(&mut self, _cpu: &mut CpuState, _number: u64, _args: [u64; 6]) -> u64 {
            0
        }
    }

    #[test]
    fn shutdown_flag_is_observed_before_the_first_block() {
        let mut mem = FlatMemory::new(&[0xC3]);
        let cache = Arc::new(RwLock::new(CodeCache::new(16)));
        let should_stop = ShouldStop::new();
        should_stop.signal();
        let mut driver = JitDriver::new(InterpreterBackend::new(), cache, should_stop, JitConfig::default(), DecodeMode::Bits64);
        let mut cpu = CpuState::default();
        let mut syscalls = NoSyscalls;
        assert_eq!(driver.run(&mut cpu, &mut mem, &mut syscalls), ExitReason::Shutdown);
    }

    #[test]
    fn cache_miss_then_hit_reuses_the_published_block() {
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let mut mem = FlatMemory::new(&code);
        let cache = Arc::new(RwLock::new(CodeCache::new(16)));
        let mut driver = JitDriver::new(
            InterpreterBackend::new(),
            cache,
            ShouldStop::new(),
            JitConfig::default(),
            DecodeMode::Bits64,
        );
        let mut cpu = CpuState::default();
        cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
        mem.write(0x4000, &0x9999u64.to_le_bytes());
        let mut syscalls = NoSyscalls;

        // RET lands at 0x9999, which holds no code, so the driver reports
        // the resulting empty-block translation failure rather than
        // running off into the weeds.
        let exit = driver.run(&mut cpu, &mut mem, &mut syscalls);
        assert_eq!(exit, ExitReason::UnknownError);
        assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 42);
        assert_eq!(cpu.rip, 0x9999);
        assert_eq!(driver.stats(), DriverStats { cache_hit: 0, cache_miss: 1 });

        // Re-enter at the original block's entry point; this time it must
        // come from the cache rather than being retranslated.
        cpu.rip = 0;
        cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
        mem.write(0x4000, &0x9999u64.to_le_bytes());
        driver.run(&mut cpu, &mut mem, &mut syscalls);
        assert_eq!(driver.stats(), DriverStats { cache_hit: 1, cache_miss: 2 });
    }
}
