//! IR compaction (spec.md §4.4 step 6): the pass manager's final stage.
//! Drops the `Instr::Nop` placeholders the earlier dead-code passes leave
//! behind and renumbers every `ValueId` to a dense, sequential range in
//! definition order, so the backend's linear scan (out of scope here, per
//! spec.md's Non-goals) can treat operand references as small integers
//! into a packed arena rather than a sparse id space.
//!
//! Running this twice on already-compact IR is a no-op (spec.md §8
//! idempotence property): with no `Nop`s left and every id already dense,
//! the rename map is the identity and nothing changes.

use dbt_ir::{Function, Instr, Operand, ValueId};
use std::collections::HashMap;

fn remap_operand(op: &mut Operand, map: &HashMap<ValueId, ValueId>) {
    if let Operand::Value(v) = op {
        if let Some(new) = map.get(v) {
            *v = *new;
        }
    }
}

/// Assigns fresh dense ids to every value `instr` defines, recording the
/// old-to-new mapping. Mirrors [`Instr::defs`]'s variant list exactly,
/// since that is the authoritative list of which fields are definitions.
fn remap_defs(instr: &mut Instr, next_id: &mut u32, map: &mut HashMap<ValueId, ValueId>) {
    let mut fresh = || {
        let id = ValueId(*next_id);
        *next_id += 1;
        id
    };
    let mut rename = |dst: &mut ValueId, map: &mut HashMap<ValueId, ValueId>| {
        let new = fresh();
        map.insert(*dst, new);
        *dst = new;
    };

    match instr {
        Instr::Const { dst, .. }
        | Instr::LoadReg { dst, .. }
        | Instr::LoadFlag { dst, .. }
        | Instr::Addr { dst, .. }
        | Instr::LoadMem { dst, .. }
        | Instr::BinOp { dst, .. }
        | Instr::UnOp { dst, .. }
        | Instr::Shift { dst, .. }
        | Instr::Rotate { dst, .. }
        | Instr::Bfi { dst, .. }
        | Instr::Bfe { dst, .. }
        | Instr::Mul { dst, .. }
        | Instr::Div { dst, .. }
        | Instr::CondSelect { dst, .. }
        | Instr::Select { dst, .. }
        | Instr::AtomicFetchOp { dst, .. }
        | Instr::AtomicCas { dst, .. }
        | Instr::Rdtsc { dst }
        | Instr::Syscall { dst, .. }
        | Instr::FastSyscall { dst, .. } => rename(dst, map),
        Instr::Cpuid { dst_eax, dst_ebx, dst_ecx, dst_edx, .. } => {
            rename(dst_eax, map);
            rename(dst_ebx, map);
            rename(dst_ecx, map);
            rename(dst_edx, map);
        }
        Instr::Nop
        | Instr::StoreReg { .. }
        | Instr::StoreFlagBit { .. }
        | Instr::StoreMem { .. }
        | Instr::SetDeferredFlags { .. }
        | Instr::MaterializeFlags
        | Instr::InvalidateDeferredFlags
        | Instr::Fence
        | Instr::MemCpy { .. }
        | Instr::MemSet { .. } => {}
    }
}

pub fn compact(f: &mut Function) -> bool {
    let mut changed = false;
    let mut map: HashMap<ValueId, ValueId> = HashMap::new();
    let mut next_id = 0u32;

    for block in &mut f.blocks {
        let before = block.instrs.len();
        block.instrs.retain(|i| !matches!(i, Instr::Nop));
        if block.instrs.len() != before {
            changed = true;
        }

        for instr in &mut block.instrs {
            instr.for_each_operand_mut(|op| {
                let before = *op;
                remap_operand(op, &map);
                if *op != before {
                    changed = true;
                }
            });
            let next_before = next_id;
            remap_defs(instr, &mut next_id, &mut map);
            if next_id != next_before {
                // A def changed id unless it already happened to be
                // exactly the next dense id in sequence.
                changed = true;
            }
        }

        if let Some(term) = &mut block.terminator {
            term.for_each_operand_mut(|op| {
                let before = *op;
                remap_operand(op, &map);
                if *op != before {
                    changed = true;
                }
            });
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_ir::{print, validate, BinOp, IrBuilder, Terminator};

    #[test]
    fn drops_nops_and_renumbers_densely() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let a = b.emit_const(1);
        let _unused = b.emit_const(2);
        let c = b.emit_binop(BinOp::Add, Operand::Value(a), Operand::Const(3));
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(c), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();
        // Simulate a prior dead-code pass having turned the unused const
        // into a Nop.
        f.blocks[0].instrs[1] = Instr::Nop;

        assert!(compact(&mut f));
        validate(&f).expect("compacted IR must stay well-formed");
        let text = print(&f);
        assert!(!text.contains("nop"), "compaction must drop Nops:\n{text}");
    }

    #[test]
    fn already_compact_ir_is_a_no_op() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let a = b.emit_const(1);
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(a), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        compact(&mut f);
        let once = print(&f);
        let changed_again = compact(&mut f);
        let twice = print(&f);
        assert!(!changed_again);
        assert_eq!(once, twice);
    }
}
