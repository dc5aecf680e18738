//! The JIT driver: turns decoded-and-lowered guest code into a running
//! translation loop (spec.md §4.5, §5, §6, §7).
//!
//! This crate wires the rest of the workspace together —
//! [`dbt_x86::decode_and_classify_block`], [`dbt_frontend::lower_all`],
//! [`dbt_passes::run`] — behind a single [`driver::JitDriver`], and ships
//! one concrete [`backend::JitBackend`] ([`interp::InterpreterBackend`])
//! since native code generation is out of scope (spec.md §1 Non-goals).

mod backend;
mod cache;
mod config;
mod driver;
mod error;
mod interp;

pub use backend::{BlockExit, GuestMemory, JitBackend, SyscallHandler};
pub use cache::{BlockDebugInfo, BlockDebugInfoEntry, CodeCache, CompiledBlockHandle, CompiledBlockMeta};
pub use config::JitConfig;
pub use driver::{DriverStats, JitDriver, ShouldStop};
pub use error::{ExitReason, JitError};
pub use interp::InterpreterBackend;
