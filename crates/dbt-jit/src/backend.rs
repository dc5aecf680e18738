//! External collaborator interfaces (spec.md §6): guest memory, the
//! syscall ABI callback, and the pluggable code generator the driver loop
//! calls into. Concrete host code generation (native x86-64/AArch64
//! emission, the LLVM fallback) is out of scope per spec.md §1's
//! Non-goals; [`crate::interp::InterpreterBackend`] is the one concrete
//! `JitBackend` this crate ships, standing in for "a backend" in tests and
//! end-to-end scenario coverage.

use crate::cache::CompiledBlockMeta;
use crate::error::JitError;
use dbt_ir::{BreakReason, Function};
use dbt_types::CpuState;

/// Guest memory access, extending [`dbt_decoder::ByteReader`] (the
/// decoder's read-only view) with the write side a backend needs for
/// `StoreMem`/`MemCpy`/`MemSet`/atomics. Kept as a trait rather than a
/// concrete type per spec.md §6: "The DBT's contract is to consume
/// `(pc, memory_reader, write_region)`" — the loader, MMU and page tables
/// are all external collaborators.
pub trait GuestMemory: dbt_decoder::ByteReader {
    fn write(&mut self, addr: u64, buf: &[u8]);
}

/// The syscall ABI callback (spec.md §6 "Syscall ABI"). `args` is always
/// six slots regardless of the guest OS-ABI variant (LINUX64/LINUX32/
/// WIN64/HANGOVER); which of them are meaningful for a given syscall
/// number is an ABI-variant concern the handler owns, not this trait.
pub trait SyscallHandler {
    fn handle_syscall(&mut self, cpu: &mut CpuState, number: u64, args: [u64; 6]) -> u64;
}

/// Outcome of running one compiled block (spec.md §4.5 pseudocode's
/// `reason`). `Normal`/`DebugStep` keep the driver loop going; every other
/// variant is terminal and becomes the [`crate::error::ExitReason`] the
/// loop returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Fell off the end of the block into `next_rip`; look up or compile
    /// the next block and keep going.
    Normal { next_rip: u64 },
    /// A single-instruction-stepping request was honored; continue the
    /// loop exactly like `Normal` (spec.md §4.5: "Debug | SingleStep:
    /// continue").
    DebugStep { next_rip: u64 },
    /// A debug trap (INT3, `TF`) actually interrupted guest execution;
    /// terminal, becomes `ExitReason::Debug`.
    DebugTrap,
    Shutdown,
    UnknownError,
    Break { reason: BreakReason, trap_number: u32, si_code: i32, error_register: u64 },
    AsyncEvent,
}

/// A pluggable code generator: turns already-lowered-and-optimized IR into
/// whatever opaque unit `invoke` later runs. `CompiledCode` is
/// backend-specific (a native code buffer's address range, a `wasmtime`
/// module handle, or — for [`crate::interp::InterpreterBackend`] — the IR
/// itself).
pub trait JitBackend {
    type CompiledCode;

    fn compile(&mut self, function: &Function) -> Result<(Self::CompiledCode, CompiledBlockMeta), JitError>;

    fn invoke(
        &mut self,
        code: &Self::CompiledCode,
        cpu: &mut CpuState,
        memory: &mut dyn GuestMemory,
        syscalls: &mut dyn SyscallHandler,
    ) -> BlockExit;
}
