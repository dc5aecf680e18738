//! Redundant flag-calculation elimination (spec.md §4.4 step 3): walks
//! each block and, whenever a pending deferred-flag record
//! (`Instr::SetDeferredFlags`) is overwritten by a later one, or dropped
//! by `InvalidateDeferredFlags`, before anything ever consumes it via
//! `MaterializeFlags`, deletes the dead record.
//!
//! `MaterializeFlags` reads the live record (if any) without clearing the
//! block's "has a record been set since the last materialize/invalidate"
//! tracking the builder itself already enforces (spec.md §3 invariant
//! (a): no terminator runs with flags pending), so by construction a
//! block never ends with a dead record still dangling.

use dbt_ir::{Function, Instr};

pub fn eliminate_redundant_flags(f: &mut Function) -> bool {
    let mut changed = false;

    for block in &mut f.blocks {
        let mut pending: Option<usize> = None;
        for i in 0..block.instrs.len() {
            match &block.instrs[i] {
                Instr::SetDeferredFlags { .. } => {
                    if let Some(prev) = pending.take() {
                        block.instrs[prev] = Instr::Nop;
                        changed = true;
                    }
                    pending = Some(i);
                }
                Instr::MaterializeFlags => {
                    // The pending record is genuinely read here; nothing
                    // to delete.
                    pending = None;
                }
                Instr::InvalidateDeferredFlags => {
                    if let Some(prev) = pending.take() {
                        block.instrs[prev] = Instr::Nop;
                        changed = true;
                    }
                }
                _ => {}
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_ir::{print, validate, DeferredFlagKind, IrBuilder, Operand, Terminator};
    use dbt_types::Width;

    #[test]
    fn overwritten_record_is_deleted() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        b.emit_set_deferred_flags(DeferredFlagKind::Add, Width::W32, Operand::Const(1), Operand::Const(2));
        b.emit_set_deferred_flags(DeferredFlagKind::Sub, Width::W32, Operand::Const(3), Operand::Const(4));
        b.materialize_deferred_flags();
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(eliminate_redundant_flags(&mut f));
        let text = print(&f);
        assert_eq!(text.matches("set_deferred_flags").count(), 1, "unexpected IR:\n{text}");
        assert!(text.contains("set_deferred_flags sub"), "the surviving record must be the later one:\n{text}");
        validate(&f).unwrap();
    }

    #[test]
    fn consumed_record_survives() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        b.emit_set_deferred_flags(DeferredFlagKind::Add, Width::W32, Operand::Const(1), Operand::Const(2));
        b.materialize_deferred_flags();
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(!eliminate_redundant_flags(&mut f));
        let text = print(&f);
        assert_eq!(text.matches("set_deferred_flags").count(), 1);
    }

    #[test]
    fn invalidated_record_is_deleted() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        b.emit_set_deferred_flags(DeferredFlagKind::Add, Width::W32, Operand::Const(1), Operand::Const(2));
        b.invalidate_deferred_flags();
        b.emit_store_flag_bit(dbt_types::ArchFlag::Cf, Operand::Const(1));
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(eliminate_redundant_flags(&mut f));
        let text = print(&f);
        assert!(!text.contains("set_deferred_flags"), "unexpected IR:\n{text}");
        validate(&f).unwrap();
    }
}
