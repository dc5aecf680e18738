//! Structural invariant checking (spec.md §3 "Invariants", §8 "dominance"
//! testable property). Runs once, right after lowering, before the pass
//! manager ever sees the IR (spec.md §4.1 "Failure semantics": these are
//! fatal programmer errors, not recoverable translation failures).

use crate::function::Function;
use crate::value::{BlockId, Operand, ValueId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrValidationError {
    #[error("block {0} has no terminator")]
    MissingTerminator(BlockId),
    #[error("value {0} used before it is defined")]
    UseBeforeDef(ValueId),
    #[error("value {value} used in block {user}, defined in non-dominating block {def}")]
    DominanceViolation { value: ValueId, def: BlockId, user: BlockId },
    #[error("value {0} defined more than once")]
    DuplicateDef(ValueId),
    #[error("terminator in block {0} references unknown block {1}")]
    UnknownSuccessor(BlockId, BlockId),
}

fn predecessors(f: &Function) -> HashMap<BlockId, Vec<BlockId>> {
    let mut preds: HashMap<BlockId, Vec<BlockId>> = f.blocks.iter().map(|b| (b.id, Vec::new())).collect();
    for block in &f.blocks {
        if let Some(term) = &block.terminator {
            for succ in term.successors() {
                preds.entry(succ).or_default().push(block.id);
            }
        }
    }
    preds
}

/// Iterative dominator computation (blocks are few per translation unit,
/// so the naive fixed point is fine; this is not a hot path).
fn dominators(f: &Function) -> HashMap<BlockId, HashSet<BlockId>> {
    let all: HashSet<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    let preds = predecessors(f);
    let mut dom: HashMap<BlockId, HashSet<BlockId>> = f
        .blocks
        .iter()
        .map(|b| (b.id, if b.id == f.entry_block { [b.id].into_iter().collect() } else { all.clone() }))
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for block in &f.blocks {
            if block.id == f.entry_block {
                continue;
            }
            let Some(ps) = preds.get(&block.id) else { continue };
            let mut new_dom: Option<HashSet<BlockId>> = None;
            for p in ps {
                let pd = dom.get(p).cloned().unwrap_or_default();
                new_dom = Some(match new_dom {
                    None => pd,
                    Some(acc) => acc.intersection(&pd).copied().collect(),
                });
            }
            let mut new_dom = new_dom.unwrap_or_default();
            new_dom.insert(block.id);
            if dom.get(&block.id) != Some(&new_dom) {
                dom.insert(block.id, new_dom);
                changed = true;
            }
        }
    }
    dom
}

/// Validate every invariant spec.md §3/§4.1 requires of a finalized
/// [`Function`]: one terminator per block, no use-before-def within a
/// block, and cross-block uses only of values whose defining block
/// dominates the using block.
pub fn validate(f: &Function) -> Result<(), IrValidationError> {
    let block_ids: HashSet<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for block in &f.blocks {
        let Some(term) = &block.terminator else {
            return Err(IrValidationError::MissingTerminator(block.id));
        };
        for succ in term.successors() {
            if !block_ids.contains(&succ) {
                return Err(IrValidationError::UnknownSuccessor(block.id, succ));
            }
        }
    }

    let dom = dominators(f);
    let mut def_block: HashMap<ValueId, BlockId> = HashMap::new();
    for block in &f.blocks {
        for instr in block.iter() {
            for d in instr.defs() {
                if def_block.insert(d, block.id).is_some() {
                    return Err(IrValidationError::DuplicateDef(d));
                }
            }
        }
    }

    for block in &f.blocks {
        let mut defined_so_far: HashSet<ValueId> = HashSet::new();
        let check_use = |op: Operand, defined_so_far: &HashSet<ValueId>| -> Result<(), IrValidationError> {
            let Operand::Value(v) = op else { return Ok(()) };
            let Some(&def) = def_block.get(&v) else {
                return Err(IrValidationError::UseBeforeDef(v));
            };
            if def == block.id {
                if !defined_so_far.contains(&v) {
                    return Err(IrValidationError::UseBeforeDef(v));
                }
            } else if !dom.get(&block.id).is_some_and(|d| d.contains(&def)) {
                return Err(IrValidationError::DominanceViolation { value: v, def, user: block.id });
            }
            Ok(())
        };

        for instr in block.iter() {
            let mut err = None;
            instr.for_each_operand(|op| {
                if err.is_none() {
                    err = check_use(op, &defined_so_far).err();
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            for d in instr.defs() {
                defined_so_far.insert(d);
            }
        }
        if let Some(term) = &block.terminator {
            let mut err = None;
            term.for_each_operand(|op| {
                if err.is_none() {
                    err = check_use(op, &defined_so_far).err();
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;
    use crate::op::{BinOp, Terminator};
    use crate::value::Operand;

    #[test]
    fn accepts_well_formed_single_block_function() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let c1 = b.emit_const(1);
        let c2 = b.emit_const(2);
        let sum = b.emit_binop(BinOp::Add, Operand::Value(c1), Operand::Value(c2));
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Value(sum) }).unwrap();
        let f = b.finish();
        assert!(validate(&f).is_ok());
    }

    #[test]
    fn rejects_use_before_def() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(ValueId(99)), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let f = b.finish();
        assert!(matches!(validate(&f), Err(IrValidationError::UseBeforeDef(_))));
    }

    #[test]
    fn dominance_holds_across_a_straight_line_diamond() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let c = b.emit_const(7);
        let then_blk = b.new_block();
        let else_blk = b.new_block();
        let join = b.new_block();
        b.terminate(entry, Terminator::CondJump { cond: dbt_types::Cond::E, if_true: then_blk, if_false: else_blk })
            .unwrap();

        b.set_current(then_blk);
        b.terminate(then_blk, Terminator::Jump { target: join }).unwrap();

        b.set_current(else_blk);
        b.terminate(else_blk, Terminator::Jump { target: join }).unwrap();

        b.set_current(join);
        // `c` is defined in `entry`, which dominates `join` (both paths
        // pass through it) — this must validate.
        b.terminate(join, Terminator::ExitFunction { rip: Operand::Value(c) }).unwrap();

        let f = b.finish();
        assert!(validate(&f).is_ok());
    }
}
