//! Dead context-store elimination (spec.md §4.4 step 5): the mirror of
//! redundant-load elimination. A store to a context slot is dead if it is
//! unconditionally overwritten by a later store to the same slot before
//! anything reads it — which, scanning a single straight-line block
//! forward, means simply: no `LoadReg`/`LoadFlag` of that slot and no
//! context side effect appears between the two stores.
//!
//! As with [`crate::redundant_load`], this is scoped per block: a store
//! that survives to a block's terminator is always kept, since whether a
//! successor block re-stores the same slot before ever reading it is a
//! whole-function reachability question this one-shot pass does not
//! attempt.

use dbt_ir::{Function, Instr};
use dbt_types::{ArchFlag, Gpr};
use std::collections::HashMap;

pub fn eliminate_dead_context_stores(f: &mut Function) -> bool {
    let mut changed = false;

    for block in &mut f.blocks {
        let mut last_store_gpr: HashMap<Gpr, usize> = HashMap::new();
        let mut last_store_flag: HashMap<ArchFlag, usize> = HashMap::new();

        for i in 0..block.instrs.len() {
            match &block.instrs[i] {
                Instr::LoadReg { reg, .. } => {
                    last_store_gpr.remove(reg);
                }
                Instr::LoadFlag { flag, .. } => {
                    last_store_flag.remove(flag);
                }
                Instr::StoreReg { reg, .. } => {
                    let reg = *reg;
                    if let Some(prev) = last_store_gpr.insert(reg, i) {
                        block.instrs[prev] = Instr::Nop;
                        changed = true;
                    }
                }
                Instr::StoreFlagBit { flag, .. } => {
                    let flag = *flag;
                    if let Some(prev) = last_store_flag.insert(flag, i) {
                        block.instrs[prev] = Instr::Nop;
                        changed = true;
                    }
                }
                other if other.has_context_side_effect() => {
                    last_store_gpr.clear();
                    last_store_flag.clear();
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
    use dbt_ir::{print, validate, IrBuilder, Operand, Terminator};
    use dbt_types::Width;

    #[test]
    fn store_overwritten_before_any_read_is_removed() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let one = b.emit_const(1);
        let two = b.emit_const(2);
        b.emit_store_reg(Gpr::Rax, Operand::Value(one), Width::W64);
        b.emit_store_reg(Gpr::Rax, Operand::Value(two), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(eliminate_dead_context_stores(&mut f));
        let text = print(&f);
        assert_eq!(text.matches("store_reg rax").count(), 1, "unexpected IR:\n{text}");
        validate(&f).unwrap();
    }

    #[test]
    fn store_read_in_between_survives() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let one = b.emit_const(1);
        b.emit_store_reg(Gpr::Rax, Operand::Value(one), Width::W64);
        let reread = b.emit_load_reg(Gpr::Rax, Width::W64);
        b.emit_store_reg(Gpr::Rbx, Operand::Value(reread), Width::W64);
        let two = b.emit_const(2);
        b.emit_store_reg(Gpr::Rax, Operand::Value(two), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(!eliminate_dead_context_stores(&mut f));
        let text = print(&f);
        assert_eq!(text.matches("store_reg rax").count(), 2);
    }

    #[test]
    fn last_store_before_exit_is_kept() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let one = b.emit_const(1);
        b.emit_store_reg(Gpr::Rax, Operand::Value(one), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(!eliminate_dead_context_stores(&mut f));
    }
}
