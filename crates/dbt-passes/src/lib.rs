//! The pass manager (spec.md §4.4): a fixed, ordered list of IR-to-IR
//! transforms run once each between lowering and backend codegen. Grounded
//! on the teacher's `aero-jit-x86::tier2::opt::{optimize_trace, OptConfig}`
//! for the "one-shot, not fixed-point" pipeline shape, and on
//! `original_source/.../PassManager.cpp` for the specific pass list and
//! order.
//!
//! Each pass is a plain function over a [`dbt_ir::Function`] returning
//! whether it changed anything; the manager runs them in the fixed order
//! spec.md §4.4 lists and never iterates to convergence (spec.md: "passes
//! are engineered to be one-shot").

mod compaction;
mod const_prop;
mod dead_context_store;
mod redundant_flags;
mod redundant_load;
mod syscall_opt;

pub use compaction::compact;
pub use const_prop::const_propagate;
pub use dead_context_store::eliminate_dead_context_stores;
pub use redundant_flags::eliminate_redundant_flags;
pub use redundant_load::eliminate_redundant_context_loads;
pub use syscall_opt::optimize_syscalls;

use dbt_ir::Function;

/// Per-pass change bit plus a name, reported back to callers that want to
/// log which passes actually touched the IR (the JIT driver's `trace!`
/// spans do, per `SPEC_FULL.md`'s logging section).
#[derive(Debug, Clone, Copy)]
pub struct PassReport {
    pub name: &'static str,
    pub changed: bool,
}

/// Runs the fixed spec.md §4.4 pipeline over `f` once, in order:
/// constant propagation, redundant context-load elimination, redundant
/// flag-calculation elimination, syscall optimization, dead context-store
/// elimination, IR compaction. Returns one [`PassReport`] per stage.
///
/// Determinism property (spec.md §8): running this twice on the same input
/// function produces byte-identical compacted IR, because every pass here
/// is a deterministic function of its input and compaction always runs
/// last regardless of whether earlier passes changed anything.
pub fn run(f: &mut Function) -> Vec<PassReport> {
    let stages: [(&'static str, fn(&mut Function) -> bool); 6] = [
        ("const_prop", const_propagate),
        ("redundant_context_load_elim", eliminate_redundant_context_loads),
        ("redundant_flag_elim", eliminate_redundant_flags),
        ("syscall_opt", optimize_syscalls),
        ("dead_context_store_elim", eliminate_dead_context_stores),
        ("ir_compaction", compact),
    ];

    let mut reports = Vec::with_capacity(stages.len());
    for (name, pass) in stages {
        let changed = pass(f);
        tracing::trace!(pass = name, changed, "ran pass");
        reports.push(PassReport { name, changed });
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_ir::{validate, BinOp, IrBuilder, Operand, Terminator};

    fn trivial_function() -> Function {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let one = b.emit_const(1);
        let two = b.emit_const(2);
        let sum = b.emit_binop(BinOp::Add, Operand::Value(one), Operand::Value(two));
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(sum), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0x1003) }).unwrap();
        b.finish()
    }

    #[test]
    fn pipeline_preserves_validity() {
        let mut f = trivial_function();
        run(&mut f);
        validate(&f).expect("pipeline output must stay well-formed");
    }

    /// spec.md §8: `pass_manager.run(g); pass_manager.run(g)` must be
    /// idempotent at the level of the final compacted IR.
    #[test]
    fn running_the_pipeline_twice_is_idempotent() {
        let mut f = trivial_function();
        run(&mut f);
        let once = dbt_ir::print(&f);
        run(&mut f);
        let twice = dbt_ir::print(&f);
        assert_eq!(once, twice, "a second pipeline run must not change already-compacted IR");
    }
}
