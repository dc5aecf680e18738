//! Error taxonomy (spec.md §7): decode/translation/runtime/cache-
//! consistency errors each get a distinct propagation path rather than one
//! catch-all `JitError`, matching the policy spec.md §7 lays out ("errors
//! producing guest-visible exceptions surface via `Break` + signal; errors
//! indicating a DBT bug surface via `UnknownError`").

use dbt_frontend::LowerError;
use dbt_ir::{BreakReason, IrValidationError};
use thiserror::Error;

/// A translation-phase failure (spec.md §7 "Translation errors"): fatal to
/// the thread attempting the translation. The driver converts this into
/// `ExitReason::UnknownError` after a best-effort RIP write-back, never
/// propagates it as a panic.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("decode_block at {0:#x} produced no instructions")]
    EmptyBlock(u64),
    #[error("lowering failed: {0}")]
    Lower(#[from] LowerError),
    #[error("lowered IR failed validation: {0}")]
    Invalid(#[from] IrValidationError),
    #[error("pass manager produced IR that failed re-validation: {0}")]
    PostPassInvalid(IrValidationError),
    #[error("backend compilation failed: {0}")]
    Backend(String),
}

/// Returned from the driver loop (spec.md §6 "Exit reason").
///
/// spec.md §4.5's pseudocode has a block-level `Debug` outcome that simply
/// `continue`s the loop (single-instruction stepping without a host
/// round-trip), while §6 separately lists `Debug` among the reasons the
/// *loop itself* returns. We resolve that by keeping those as two distinct
/// concepts: [`crate::backend::BlockExit::DebugStep`] continues the loop;
/// this `Debug` variant is what the loop returns when a debug trap (INT3,
/// single-step `TF`) actually interrupts guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Debug,
    Break { reason: BreakReason, trap_number: u32, si_code: i32, error_register: u64 },
    UnknownError,
    AsyncEvent,
}
