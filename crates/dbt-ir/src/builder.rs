//! The mutation API of spec.md §4.1: `emit`, `new_block`, `set_current`,
//! `terminate`, `link`, `iter`, `print`. Grounded on the teacher's
//! `tier2::trace::TraceBuilder` (the surrounding-state-machine shape) and
//! `tier1::ir::IrBuilder` (single-function-at-a-time emission).

use crate::function::{Function, FunctionState};
use crate::op::{BinOp, DeferredFlagKind, DivPart, Instr, MulPart, RotateKind, ShiftKind, Terminator};
use crate::value::{BlockId, Operand, ValueId};
use dbt_types::{ArchFlag, Gpr, Width};

/// Programmer-error conditions caught during IR construction (spec.md
/// §4.1 "Failure semantics": fatal, caught before the pass manager sees
/// the IR). These never represent guest-visible failures — those are
/// `Instr::Break`/`Terminator::Break` values, not `Err` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IrBuildError {
    #[error("emitted into a sealed block")]
    EmitIntoSealedBlock,
    #[error("terminated an already-sealed block")]
    DoubleTerminator,
    #[error("terminator emitted with deferred flags still pending")]
    TerminatorWithPendingFlags,
}

/// Incrementally constructs one [`Function`], tracking the current block
/// and whether a deferred-flag record is currently pending (spec.md §3
/// invariant (a)).
pub struct IrBuilder {
    function: Function,
    current: BlockId,
    next_value: u32,
    flags_pending: bool,
}

impl IrBuilder {
    #[must_use]
    pub fn new(entry_rip: u64) -> Self {
        let function = Function::new(entry_rip);
        let current = function.entry_block;
        IrBuilder { function, current, next_value: 0, flags_pending: false }
    }

    #[must_use]
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    /// Append one instruction to the current block's region, returning the
    /// value it defines (if any). Fails fatally if the current block is
    /// already sealed (spec.md §4.1: "emitting into a terminated block is
    /// a bug").
    pub fn emit(&mut self, instr: Instr) -> Result<Vec<ValueId>, IrBuildError> {
        if self.function.block(self.current).is_sealed() {
            return Err(IrBuildError::EmitIntoSealedBlock);
        }
        if matches!(instr, Instr::SetDeferredFlags { .. }) {
            self.flags_pending = true;
        }
        if matches!(instr, Instr::MaterializeFlags | Instr::InvalidateDeferredFlags) {
            self.flags_pending = false;
        }
        let defs = instr.defs();
        self.function.block_mut(self.current).instrs.push(instr);
        Ok(defs)
    }

    pub fn emit_const(&mut self, value: u64) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Const { dst, value }).expect("emit into open block");
        dst
    }

    pub fn emit_load_reg(&mut self, reg: Gpr, width: Width) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::LoadReg { dst, reg, width }).expect("emit into open block");
        dst
    }

    pub fn emit_store_reg(&mut self, reg: Gpr, src: Operand, width: Width) {
        self.emit(Instr::StoreReg { reg, src, width }).expect("emit into open block");
    }

    pub fn emit_load_flag(&mut self, flag: ArchFlag) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::LoadFlag { dst, flag }).expect("emit into open block");
        dst
    }

    pub fn emit_store_flag_bit(&mut self, flag: ArchFlag, value: Operand) {
        self.emit(Instr::StoreFlagBit { flag, value }).expect("emit into open block");
    }

    pub fn emit_addr(&mut self, base: Option<Operand>, index: Option<(Operand, u8)>, disp: i64) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Addr { dst, base, index, disp }).expect("emit into open block");
        dst
    }

    pub fn emit_load_mem(&mut self, addr: Operand, width: Width, order: crate::op::MemOrder) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::LoadMem { dst, addr, width, order }).expect("emit into open block");
        dst
    }

    pub fn emit_store_mem(&mut self, addr: Operand, src: Operand, width: Width, order: crate::op::MemOrder) {
        self.emit(Instr::StoreMem { addr, src, width, order }).expect("emit into open block");
    }

    pub fn emit_binop(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::BinOp { dst, op, lhs, rhs }).expect("emit into open block");
        dst
    }

    pub fn emit_unop(&mut self, op: crate::op::UnOp, src: Operand, width: Width) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::UnOp { dst, op, src, width }).expect("emit into open block");
        dst
    }

    pub fn emit_shift(&mut self, op: ShiftKind, value: Operand, count: Operand, width: Width) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Shift { dst, op, value, count, width }).expect("emit into open block");
        dst
    }

    pub fn emit_rotate(&mut self, op: RotateKind, value: Operand, count: Operand, width: Width) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Rotate { dst, op, value, count, width }).expect("emit into open block");
        dst
    }

    pub fn emit_bfi(&mut self, base: Operand, insert: Operand, lsb: u8, width: u8) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Bfi { dst, base, insert, lsb, width }).expect("emit into open block");
        dst
    }

    pub fn emit_bfe(&mut self, src: Operand, lsb: u8, width: u8, signed: bool) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Bfe { dst, src, lsb, width, signed }).expect("emit into open block");
        dst
    }

    pub fn emit_mul(&mut self, lhs: Operand, rhs: Operand, width: Width, signed: bool, part: MulPart) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Mul { dst, lhs, rhs, width, signed, part }).expect("emit into open block");
        dst
    }

    pub fn emit_div(
        &mut self,
        lo: Operand,
        hi: Operand,
        divisor: Operand,
        width: Width,
        signed: bool,
        part: DivPart,
    ) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Div { dst, lo, hi, divisor, width, signed, part }).expect("emit into open block");
        dst
    }

    pub fn emit_cond_select(&mut self, cond: dbt_types::Cond, if_true: Operand, if_false: Operand) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::CondSelect { dst, cond, if_true, if_false }).expect("emit into open block");
        dst
    }

    pub fn emit_select(&mut self, cond: Operand, if_true: Operand, if_false: Operand) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Select { dst, cond, if_true, if_false }).expect("emit into open block");
        dst
    }

    pub fn emit_set_deferred_flags(&mut self, kind: DeferredFlagKind, width: Width, lhs: Operand, rhs: Operand) {
        self.emit(Instr::SetDeferredFlags { kind, width, lhs, rhs }).expect("emit into open block");
    }

    pub fn materialize_deferred_flags(&mut self) {
        self.emit(Instr::MaterializeFlags).expect("emit into open block");
    }

    pub fn invalidate_deferred_flags(&mut self) {
        self.emit(Instr::InvalidateDeferredFlags).expect("emit into open block");
    }

    pub fn emit_atomic_fetch(
        &mut self,
        addr: Operand,
        op: crate::op::AtomicOp,
        src: Operand,
        width: Width,
    ) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::AtomicFetchOp { dst, addr, op, src, width }).expect("emit into open block");
        dst
    }

    pub fn emit_atomic_cas(&mut self, addr: Operand, expected: Operand, new: Operand, width: Width) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::AtomicCas { dst, addr, expected, new, width }).expect("emit into open block");
        dst
    }

    pub fn emit_fence(&mut self) {
        self.emit(Instr::Fence).expect("emit into open block");
    }

    pub fn emit_mem_copy(&mut self, dst_addr: Operand, src_addr: Operand, count: Operand, width: Width, backward: bool) {
        self.emit(Instr::MemCpy { dst_addr, src_addr, count, width, backward }).expect("emit into open block");
    }

    pub fn emit_mem_set(&mut self, addr: Operand, value: Operand, count: Operand, width: Width, backward: bool) {
        self.emit(Instr::MemSet { addr, value, count, width, backward }).expect("emit into open block");
    }

    pub fn emit_cpuid(&mut self, leaf: Operand) -> [ValueId; 4] {
        let regs = [self.fresh_value(), self.fresh_value(), self.fresh_value(), self.fresh_value()];
        self.emit(Instr::Cpuid { dst_eax: regs[0], dst_ebx: regs[1], dst_ecx: regs[2], dst_edx: regs[3], leaf })
            .expect("emit into open block");
        regs
    }

    pub fn emit_rdtsc(&mut self) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Rdtsc { dst }).expect("emit into open block");
        dst
    }

    pub fn emit_syscall(&mut self, number: Operand, args: [Operand; 6]) -> ValueId {
        let dst = self.fresh_value();
        self.emit(Instr::Syscall { dst, number, args }).expect("emit into open block");
        dst
    }

    /// Create a new, initially-unreachable block and return its id. Wiring
    /// it into the function's control flow is the caller's job (via a
    /// terminator referencing it, or via [`IrBuilder::link`]).
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.function.blocks.len() as u32);
        self.function.blocks.push(crate::block::Block::new(id));
        id
    }

    pub fn set_current(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Seal `block` with `terminator`. Fatal if `block` is already sealed,
    /// or if a deferred-flag record is still pending (spec.md §3
    /// invariant (a)).
    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) -> Result<(), IrBuildError> {
        if self.flags_pending {
            return Err(IrBuildError::TerminatorWithPendingFlags);
        }
        let b = self.function.block_mut(block);
        if b.is_sealed() {
            return Err(IrBuildError::DoubleTerminator);
        }
        tracing::trace!(block = block.0, terminator = ?terminator, "sealing block");
        b.terminator = Some(terminator);
        b.state = crate::block::BlockState::Sealed;
        Ok(())
    }

    /// Idempotent: no-op if `pred`'s terminator already names `succ`.
    /// Present for symmetry with spec.md's `link(pred, succ)` contract;
    /// in this builder the block list order itself records reachability,
    /// so this only asserts the terminator already points the right way.
    pub fn link(&self, pred: BlockId, succ: BlockId) {
        let term = &self.function.block(pred).terminator;
        if let Some(t) = term {
            debug_assert!(
                t.successors().contains(&succ),
                "link() called for a pred/succ pair not reflected in the terminator"
            );
        }
    }

    #[must_use]
    pub fn iter(&self, block: BlockId) -> std::slice::Iter<'_, Instr> {
        self.function.block(block).iter()
    }

    /// Finalize the function: every block must be sealed. Consumes the
    /// builder (spec.md §4.1 state-machine: `Building -> Finalized`).
    pub fn finish(mut self) -> Function {
        debug_assert!(
            self.function.blocks.iter().all(crate::block::Block::is_sealed),
            "finish() called with an unsealed block"
        );
        self.function.state = FunctionState::Finalized;
        self.function
    }

    #[must_use]
    pub fn function(&self) -> &Function {
        &self.function
    }
}
