//! `lower(decoded_instr)` (spec.md §4.3): maps one classified x86
//! instruction onto IR emission against the current open block, including
//! the representative algorithms spec.md calls out by name (shifts,
//! rotates, widening multiply/divide, REP string ops, locked bit/exchange
//! ops, condition-code decoding) and the NZ-zero-CV deferred-flag
//! protocol for AND/OR/XOR/TEST-family ops.

use crate::operand_access::{effective_address, load_source, store_result};
use dbt_ir::{
    AtomicOp, BinOp, BreakReason, DeferredFlagKind, DivPart, IrBuildError, IrBuilder, MemOrder, MulPart,
    Operand as IrOperand, RotateKind, ShiftKind, Terminator, UnOp,
};
use dbt_types::{ArchFlag, Cond, Gpr, Width};
use dbt_x86::{
    AluOp, BitOp, ClassifiedInstruction, FlagWriteOp, InstKind, JumpTarget, Operand as X86Operand, RepPrefix,
    RotateOp, ShiftOp, StringOp,
};

/// Decoded `int` vectors below this literal are Linux's legacy 32-bit
/// syscall gate; every other vector is an unmodeled software interrupt
/// (spec.md §4.3 "Failure semantics").
const LINUX32_SYSCALL_VECTOR: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error(transparent)]
    Build(#[from] IrBuildError),
}

fn width_from_bytes(bytes: u32) -> Width {
    match bytes {
        1 => Width::W8,
        2 => Width::W16,
        8 => Width::W64,
        _ => Width::W32,
    }
}

fn reg_operand(reg: Gpr, width: Width) -> X86Operand {
    X86Operand::Reg { reg, width, high8: false }
}

fn shift_mask(width: Width) -> u64 {
    if width == Width::W64 { 0x3f } else { 0x1f }
}

/// Lowers one classified instruction into `b`'s currently open block,
/// leaving `b.current_block()` pointing at whichever block subsequent
/// instructions should append to (string-op loop expansion and the
/// divide-by-zero guard both relocate the cursor to a fresh join block).
pub fn lower(b: &mut IrBuilder, ci: &ClassifiedInstruction) -> Result<(), LowerError> {
    let width = width_from_bytes(ci.decoded.operand_size);
    let next_ip = ci.decoded.rip + u64::from(ci.decoded.len());

    // Every `terminate()` call (including the ones this module builds
    // internally for the shift/div guards and the string-compare loop)
    // requires no deferred-flag record left pending by a prior instruction
    // (builder invariant (a)). Flush unconditionally up front; it is a
    // no-op when nothing is pending. CLC/STC/CMC/CLD/STD invalidate rather
    // than materialize, since they are about to overwrite a single flag
    // bit rather than read the recipe.
    if !matches!(ci.kind, InstKind::ExplicitFlagWrite { .. }) {
        b.materialize_deferred_flags();
    }

    match &ci.kind {
        InstKind::Invalid => {
            let cur = b.current_block();
            b.terminate(cur, Terminator::Break { reason: BreakReason::Sigill, trap_number: 6, si_code: 0, error_register: 0 })?;
        }
        InstKind::Unsupported { .. } => {
            let cur = b.current_block();
            b.terminate(cur, Terminator::ExitFunction { rip: IrOperand::Const(next_ip) })?;
        }
        InstKind::Nop => {
            b.emit(dbt_ir::Instr::Nop)?;
        }
        InstKind::Mov { dst, src } => {
            let v = load_source(b, src, width, next_ip);
            store_result(b, dst, v, width, next_ip);
        }
        InstKind::Lea { dst, addr } => {
            let dst_width = operand_width(dst, width);
            let a = effective_address(b, addr, next_ip);
            store_result(b, dst, a, dst_width, next_ip);
        }
        InstKind::Alu { op, dst, src } => lower_alu(b, *op, dst, src, width, next_ip),
        InstKind::Not { dst } => {
            let v = load_source(b, dst, width, next_ip);
            let r = b.emit_unop(UnOp::Not, v, width);
            store_result(b, dst, IrOperand::Value(r), width, next_ip);
        }
        InstKind::Neg { dst } => {
            let v = load_source(b, dst, width, next_ip);
            let r = b.emit_unop(UnOp::Neg, v, width);
            store_result(b, dst, IrOperand::Value(r), width, next_ip);
            b.emit_set_deferred_flags(DeferredFlagKind::Sub, width, IrOperand::Const(0), v);
        }
        InstKind::Shift { op, dst, count } => lower_shift(b, *op, dst, count, width, next_ip)?,
        InstKind::DoubleShift { op, dst, src, count } => lower_double_shift(b, *op, dst, src, count, width, next_ip),
        InstKind::Rotate { op, dst, count } => lower_rotate(b, *op, dst, count, width, next_ip),
        InstKind::Mul { signed, src } => lower_mul_one_operand(b, *signed, src, width, next_ip),
        InstKind::ImulWide { dst, src, imm } => lower_imul_wide(b, dst, src, imm.as_ref(), width, next_ip),
        InstKind::Div { signed, src } => lower_div(b, *signed, src, width, next_ip)?,
        InstKind::Push { src } => lower_push(b, src, width, next_ip),
        InstKind::Pop { dst } => lower_pop(b, dst, width, next_ip),
        InstKind::Jmp { target } => lower_jmp(b, target, next_ip)?,
        InstKind::Jcc { cond, target } => lower_jcc(b, *cond, target, next_ip)?,
        InstKind::SetCc { cond, dst } => {
            let v = b.emit_cond_select(*cond, IrOperand::Const(1), IrOperand::Const(0));
            store_result(b, dst, IrOperand::Value(v), Width::W8, next_ip);
        }
        InstKind::CmovCc { cond, dst, src } => {
            let src_val = load_source(b, src, width, next_ip);
            let dst_val = load_source(b, dst, width, next_ip);
            let v = b.emit_cond_select(*cond, src_val, dst_val);
            store_result(b, dst, IrOperand::Value(v), width, next_ip);
        }
        InstKind::Call { target } => lower_call(b, target, width, next_ip)?,
        InstKind::Ret => lower_ret(b, next_ip)?,
        InstKind::BitTest { op, dst, bit, lock } => lower_bit_test(b, *op, dst, bit, *lock, width, next_ip),
        InstKind::Xadd { dst, src, lock } => lower_xadd(b, dst, src, *lock, width, next_ip),
        InstKind::Xchg { a, b: b_op } => lower_xchg(b, a, b_op, width, next_ip),
        InstKind::Cmpxchg { dst, src, lock } => lower_cmpxchg(b, dst, src, *lock, width, next_ip),
        InstKind::StringOp { op, rep, width: sw } => lower_string_op(b, *op, *rep, *sw, next_ip)?,
        InstKind::Cpuid => lower_cpuid(b, next_ip),
        InstKind::Rdtsc => lower_rdtsc(b, next_ip),
        InstKind::Syscall => lower_syscall(b, next_ip)?,
        InstKind::Int { vector } => lower_int(b, *vector, next_ip)?,
        InstKind::Halt => {
            let cur = b.current_block();
            b.terminate(cur, Terminator::Break { reason: BreakReason::Sigill, trap_number: 0, si_code: 0, error_register: 0 })?;
        }
        InstKind::ExplicitFlagWrite { op } => lower_flag_write(b, *op),
        InstKind::Ud2 => {
            let cur = b.current_block();
            b.terminate(cur, Terminator::Break { reason: BreakReason::Sigill, trap_number: 6, si_code: 0, error_register: 0 })?;
        }
    }
    Ok(())
}

fn operand_width(op: &X86Operand, fallback: Width) -> Width {
    match *op {
        X86Operand::Reg { width, .. } | X86Operand::Imm { width, .. } => width,
        _ => fallback,
    }
}

fn deferred_kind_for_alu(op: AluOp) -> DeferredFlagKind {
    match op {
        AluOp::Add | AluOp::Adc => DeferredFlagKind::Add,
        AluOp::Sub | AluOp::Sbb => DeferredFlagKind::Sub,
        AluOp::Cmp => DeferredFlagKind::Cmp,
        AluOp::And => DeferredFlagKind::And,
        AluOp::Test => DeferredFlagKind::Test,
        AluOp::Or => DeferredFlagKind::Or,
        AluOp::Xor => DeferredFlagKind::Xor,
    }
}

fn lower_alu(b: &mut IrBuilder, op: AluOp, dst: &X86Operand, src: &X86Operand, width: Width, next_ip: u64) {
    let dst_val = load_source(b, dst, width, next_ip);
    let src_val = load_source(b, src, width, next_ip);
    let kind = deferred_kind_for_alu(op);

    // ADC/SBB fold the carry in before recording the deferred-flag recipe;
    // the recipe itself is still keyed on the pre-carry operands, which
    // loses the carry-in from the recomputed flags. Documented simplification
    // (DESIGN.md): ADC/SBB flag recomputation is approximate.
    let result = match op {
        AluOp::Add => b.emit_binop(BinOp::Add, dst_val, src_val),
        AluOp::Adc => {
            let cf = b.emit_load_flag(ArchFlag::Cf);
            let sum = b.emit_binop(BinOp::Add, dst_val, src_val);
            b.emit_binop(BinOp::Add, IrOperand::Value(sum), IrOperand::Value(cf))
        }
        AluOp::Sub | AluOp::Cmp => b.emit_binop(BinOp::Sub, dst_val, src_val),
        AluOp::Sbb => {
            let cf = b.emit_load_flag(ArchFlag::Cf);
            let diff = b.emit_binop(BinOp::Sub, dst_val, src_val);
            b.emit_binop(BinOp::Sub, IrOperand::Value(diff), IrOperand::Value(cf))
        }
        AluOp::And | AluOp::Test => b.emit_binop(BinOp::And, dst_val, src_val),
        AluOp::Or => b.emit_binop(BinOp::Or, dst_val, src_val),
        AluOp::Xor => b.emit_binop(BinOp::Xor, dst_val, src_val),
    };

    if !matches!(op, AluOp::Cmp | AluOp::Test) {
        store_result(b, dst, IrOperand::Value(result), width, next_ip);
    }
    b.emit_set_deferred_flags(kind, width, dst_val, src_val);
}

/// Shift-by-zero must leave FLAGS architecturally untouched (spec.md §8
/// scenario 3), which is a runtime decision when `count` is a register —
/// so the guard is a real `BranchIf`, not a compile-time check.
fn lower_shift(
    b: &mut IrBuilder,
    op: ShiftOp,
    dst: &X86Operand,
    count: &X86Operand,
    width: Width,
    next_ip: u64,
) -> Result<(), LowerError> {
    let val = load_source(b, dst, width, next_ip);
    let raw_count = load_source(b, count, Width::W8, next_ip);
    let masked = b.emit_binop(BinOp::And, raw_count, IrOperand::Const(shift_mask(width)));
    let masked = IrOperand::Value(masked);

    let kind = match op {
        ShiftOp::Shl => ShiftKind::Shl,
        ShiftOp::Shr => ShiftKind::Shr,
        ShiftOp::Sar => ShiftKind::Sar,
    };
    let result = b.emit_shift(kind, val, masked, width);
    store_result(b, dst, IrOperand::Value(result), width, next_ip);

    let is_zero = b.emit_binop(BinOp::Eq, masked, IrOperand::Const(0));
    let current = b.current_block();
    let skip_blk = b.new_block();
    let flag_blk = b.new_block();
    let join_blk = b.new_block();
    b.terminate(current, Terminator::BranchIf { cond: IrOperand::Value(is_zero), if_true: skip_blk, if_false: flag_blk })?;

    b.set_current(skip_blk);
    b.terminate(skip_blk, Terminator::Jump { target: join_blk })?;

    b.set_current(flag_blk);
    let deferred_kind = match op {
        ShiftOp::Shl => DeferredFlagKind::Shl,
        ShiftOp::Shr => DeferredFlagKind::Shr,
        ShiftOp::Sar => DeferredFlagKind::Sar,
    };
    b.emit_set_deferred_flags(deferred_kind, width, val, masked);
    b.materialize_deferred_flags();
    b.terminate(flag_blk, Terminator::Jump { target: join_blk })?;

    b.set_current(join_blk);
    Ok(())
}

/// SHLD/SHRD (spec.md §4.3): concatenate `dst`/`src` into a 2·width-bit
/// scratch, shift, and slice out the half that becomes the new `dst`.
/// Exact for width in {8,16,32}; width==64 would need a 128-bit scratch our
/// 64-bit IR values cannot hold, so it reuses the same formula with
/// whatever truncation the 64-bit ops apply (documented simplification).
fn lower_double_shift(
    b: &mut IrBuilder,
    op: ShiftOp,
    dst: &X86Operand,
    src: &X86Operand,
    count: &X86Operand,
    width: Width,
    next_ip: u64,
) {
    let dst_val = load_source(b, dst, width, next_ip);
    let src_val = load_source(b, src, width, next_ip);
    let raw_count = load_source(b, count, Width::W8, next_ip);
    let masked = IrOperand::Value(b.emit_binop(BinOp::And, raw_count, IrOperand::Const(0x1f)));
    let w = width.bits() as u8;

    let result = match op {
        ShiftOp::Shl | ShiftOp::Sar => {
            // SHLD: combined = dst:src (dst high), shift left, take the high half.
            let dst_hi = b.emit_binop(BinOp::Shl, dst_val, IrOperand::Const(u64::from(w)));
            let combined = b.emit_binop(BinOp::Or, IrOperand::Value(dst_hi), src_val);
            let shifted = b.emit_shift(ShiftKind::Shl, IrOperand::Value(combined), masked, Width::W64);
            b.emit_bfe(IrOperand::Value(shifted), w, w, false)
        }
        ShiftOp::Shr => {
            // SHRD: combined = src:dst (src high), shift right, take the low half.
            let src_hi = b.emit_binop(BinOp::Shl, src_val, IrOperand::Const(u64::from(w)));
            let combined = b.emit_binop(BinOp::Or, IrOperand::Value(src_hi), dst_val);
            let shifted = b.emit_shift(ShiftKind::Shr, IrOperand::Value(combined), masked, Width::W64);
            b.emit_bfe(IrOperand::Value(shifted), 0, w, false)
        }
    };
    store_result(b, dst, IrOperand::Value(result), width, next_ip);
    b.emit_set_deferred_flags(DeferredFlagKind::Rotate, width, dst_val, masked);
}

fn lower_rotate(b: &mut IrBuilder, op: RotateOp, dst: &X86Operand, count: &X86Operand, width: Width, next_ip: u64) {
    let val = load_source(b, dst, width, next_ip);
    let raw_count = load_source(b, count, Width::W8, next_ip);
    let masked = IrOperand::Value(b.emit_binop(BinOp::And, raw_count, IrOperand::Const(shift_mask(width))));

    // RCL/RCR's carry-chained cascade (spec.md §4.3) is not modeled; they
    // fall back to a plain rotate that ignores the incoming/outgoing carry
    // bit (documented simplification, DESIGN.md).
    let kind = match op {
        RotateOp::Rol | RotateOp::Rcl => RotateKind::Rol,
        RotateOp::Ror | RotateOp::Rcr => RotateKind::Ror,
    };
    let result = b.emit_rotate(kind, val, masked, width);
    store_result(b, dst, IrOperand::Value(result), width, next_ip);
    b.emit_set_deferred_flags(DeferredFlagKind::Rotate, width, val, masked);
}

fn lower_mul_one_operand(b: &mut IrBuilder, signed: bool, src: &X86Operand, width: Width, next_ip: u64) {
    let acc = reg_operand(Gpr::Rax, width);
    let acc_val = load_source(b, &acc, width, next_ip);
    let src_val = load_source(b, src, width, next_ip);
    let lo = b.emit_mul(acc_val, src_val, width, signed, MulPart::Low);
    let hi = b.emit_mul(acc_val, src_val, width, signed, MulPart::High);

    if width == Width::W8 {
        let ax = b.emit_bfi(IrOperand::Value(lo), IrOperand::Value(hi), 8, 8);
        store_result(b, &reg_operand(Gpr::Rax, Width::W16), IrOperand::Value(ax), Width::W16, next_ip);
    } else {
        store_result(b, &reg_operand(Gpr::Rax, width), IrOperand::Value(lo), width, next_ip);
        store_result(b, &reg_operand(Gpr::Rdx, width), IrOperand::Value(hi), width, next_ip);
    }
    b.emit_set_deferred_flags(DeferredFlagKind::Mul, width, acc_val, src_val);
}

fn lower_imul_wide(
    b: &mut IrBuilder,
    dst: &X86Operand,
    src: &X86Operand,
    imm: Option<&X86Operand>,
    width: Width,
    next_ip: u64,
) {
    let (lhs, rhs) = match imm {
        Some(imm_op) => (load_source(b, src, width, next_ip), load_source(b, imm_op, width, next_ip)),
        None => (load_source(b, dst, width, next_ip), load_source(b, src, width, next_ip)),
    };
    let lo = b.emit_mul(lhs, rhs, width, true, MulPart::Low);
    store_result(b, dst, IrOperand::Value(lo), width, next_ip);
    b.emit_set_deferred_flags(DeferredFlagKind::Mul, width, lhs, rhs);
}

/// DIV/IDIV (spec.md §4.3): division by zero raises `#DE`, modeled as a
/// real control-flow guard (`BranchIf`) into a `Break(SIGFPE)` block rather
/// than a flag, since there is no IR-level concept of a guest exception
/// short of sealing the block.
fn lower_div(b: &mut IrBuilder, signed: bool, src: &X86Operand, width: Width, next_ip: u64) -> Result<(), LowerError> {
    let (lo, hi) = if width == Width::W8 {
        let ax = b.emit_load_reg(Gpr::Rax, Width::W64);
        let lo = b.emit_bfe(IrOperand::Value(ax), 0, 8, false);
        let hi = b.emit_bfe(IrOperand::Value(ax), 8, 8, false);
        (IrOperand::Value(lo), IrOperand::Value(hi))
    } else {
        let rax = b.emit_load_reg(Gpr::Rax, Width::W64);
        let rdx = b.emit_load_reg(Gpr::Rdx, Width::W64);
        let lo = b.emit_bfe(IrOperand::Value(rax), 0, width.bits() as u8, false);
        let hi = b.emit_bfe(IrOperand::Value(rdx), 0, width.bits() as u8, false);
        (IrOperand::Value(lo), IrOperand::Value(hi))
    };
    let divisor = load_source(b, src, width, next_ip);
    let is_zero = b.emit_binop(BinOp::Eq, divisor, IrOperand::Const(0));

    let current = b.current_block();
    let fault_blk = b.new_block();
    let ok_blk = b.new_block();
    b.terminate(current, Terminator::BranchIf { cond: IrOperand::Value(is_zero), if_true: fault_blk, if_false: ok_blk })?;
    b.terminate(fault_blk, Terminator::Break { reason: BreakReason::Sigfpe, trap_number: 0, si_code: 0, error_register: 0 })?;

    b.set_current(ok_blk);
    let q = b.emit_div(lo, hi, divisor, width, signed, DivPart::Quotient);
    let r = b.emit_div(lo, hi, divisor, width, signed, DivPart::Remainder);
    if width == Width::W8 {
        let ax = b.emit_bfi(IrOperand::Value(q), IrOperand::Value(r), 8, 8);
        store_result(b, &reg_operand(Gpr::Rax, Width::W16), IrOperand::Value(ax), Width::W16, next_ip);
    } else {
        store_result(b, &reg_operand(Gpr::Rax, width), IrOperand::Value(q), width, next_ip);
        store_result(b, &reg_operand(Gpr::Rdx, width), IrOperand::Value(r), width, next_ip);
    }
    Ok(())
}

fn lower_push(b: &mut IrBuilder, src: &X86Operand, width: Width, next_ip: u64) {
    let rsp = b.emit_load_reg(Gpr::Rsp, Width::W64);
    let new_rsp = b.emit_binop(BinOp::Sub, IrOperand::Value(rsp), IrOperand::Const(u64::from(width.bytes())));
    b.emit_store_reg(Gpr::Rsp, IrOperand::Value(new_rsp), Width::W64);
    let val = load_source(b, src, width, next_ip);
    b.emit_store_mem(IrOperand::Value(new_rsp), val, width, MemOrder::NonTso);
}

fn lower_pop(b: &mut IrBuilder, dst: &X86Operand, width: Width, next_ip: u64) {
    let rsp = b.emit_load_reg(Gpr::Rsp, Width::W64);
    let val = b.emit_load_mem(IrOperand::Value(rsp), width, MemOrder::NonTso);
    let new_rsp = b.emit_binop(BinOp::Add, IrOperand::Value(rsp), IrOperand::Const(u64::from(width.bytes())));
    b.emit_store_reg(Gpr::Rsp, IrOperand::Value(new_rsp), Width::W64);
    store_result(b, dst, IrOperand::Value(val), width, next_ip);
}

fn resolve_jump_target(b: &mut IrBuilder, target: &JumpTarget, next_ip: u64) -> IrOperand {
    match *target {
        JumpTarget::Relative(offset) => IrOperand::Const(next_ip.wrapping_add(offset as u64)),
        JumpTarget::Indirect(op) => load_source(b, &op, Width::W64, next_ip),
    }
}

fn lower_jmp(b: &mut IrBuilder, target: &JumpTarget, next_ip: u64) -> Result<(), LowerError> {
    let rip = resolve_jump_target(b, target, next_ip);
    let cur = b.current_block();
    b.terminate(cur, Terminator::ExitFunction { rip })?;
    Ok(())
}

fn lower_jcc(b: &mut IrBuilder, cond: Cond, target: &JumpTarget, next_ip: u64) -> Result<(), LowerError> {
    let taken_rip = resolve_jump_target(b, target, next_ip);
    let cur = b.current_block();
    let taken_blk = b.new_block();
    let fallthrough_blk = b.new_block();
    b.terminate(taken_blk, Terminator::ExitFunction { rip: taken_rip })?;
    b.terminate(fallthrough_blk, Terminator::ExitFunction { rip: IrOperand::Const(next_ip) })?;
    b.terminate(cur, Terminator::CondJump { cond, if_true: taken_blk, if_false: fallthrough_blk })?;
    Ok(())
}

fn lower_call(b: &mut IrBuilder, target: &JumpTarget, width: Width, next_ip: u64) -> Result<(), LowerError> {
    let rsp = b.emit_load_reg(Gpr::Rsp, Width::W64);
    let new_rsp = b.emit_binop(BinOp::Sub, IrOperand::Value(rsp), IrOperand::Const(8));
    b.emit_store_reg(Gpr::Rsp, IrOperand::Value(new_rsp), Width::W64);
    b.emit_store_mem(IrOperand::Value(new_rsp), IrOperand::Const(next_ip), Width::W64, MemOrder::NonTso);
    let _ = width;
    let rip = resolve_jump_target(b, target, next_ip);
    let cur = b.current_block();
    b.terminate(cur, Terminator::ExitFunction { rip })?;
    Ok(())
}

fn lower_ret(b: &mut IrBuilder, next_ip: u64) -> Result<(), LowerError> {
    let _ = next_ip;
    let rsp = b.emit_load_reg(Gpr::Rsp, Width::W64);
    let ret_val = b.emit_load_mem(IrOperand::Value(rsp), Width::W64, MemOrder::NonTso);
    let new_rsp = b.emit_binop(BinOp::Add, IrOperand::Value(rsp), IrOperand::Const(8));
    b.emit_store_reg(Gpr::Rsp, IrOperand::Value(new_rsp), Width::W64);
    let cur = b.current_block();
    b.terminate(cur, Terminator::ExitFunction { rip: IrOperand::Value(ret_val) })?;
    Ok(())
}

/// BT/BTS/BTR/BTC (spec.md §4.3): the bit index is a runtime value, so the
/// single-bit mask is built with a variable-count `Shift` rather than
/// `Bfe`/`Bfi`, whose field offsets must be compile-time constants.
fn lower_bit_test(b: &mut IrBuilder, op: BitOp, dst: &X86Operand, bit: &X86Operand, lock: bool, width: Width, next_ip: u64) {
    let bit_val = load_source(b, bit, width, next_ip);
    let masked_bit = IrOperand::Value(b.emit_binop(BinOp::And, bit_val, IrOperand::Const(u64::from(width.bits() - 1))));
    let mask = IrOperand::Value(b.emit_shift(ShiftKind::Shl, IrOperand::Const(1), masked_bit, width));

    if lock && dst.is_memory() {
        let addr = effective_address(b, dst, next_ip);
        let dst_val = load_source(b, dst, width, next_ip);
        let shifted = b.emit_shift(ShiftKind::Shr, dst_val, masked_bit, width);
        let cf = b.emit_bfe(IrOperand::Value(shifted), 0, 1, false);
        b.emit_store_flag_bit(ArchFlag::Cf, IrOperand::Value(cf));
        match op {
            BitOp::Bt => {}
            BitOp::Bts => {
                b.emit_atomic_fetch(addr, AtomicOp::Or, mask, width);
            }
            BitOp::Btr => {
                let not_mask = b.emit_unop(UnOp::Not, mask, width);
                b.emit_atomic_fetch(addr, AtomicOp::And, IrOperand::Value(not_mask), width);
            }
            BitOp::Btc => {
                b.emit_atomic_fetch(addr, AtomicOp::Xor, mask, width);
            }
        }
        return;
    }

    let val = load_source(b, dst, width, next_ip);
    let shifted = b.emit_shift(ShiftKind::Shr, val, masked_bit, width);
    let cf = b.emit_bfe(IrOperand::Value(shifted), 0, 1, false);
    b.emit_store_flag_bit(ArchFlag::Cf, IrOperand::Value(cf));
    let new_val = match op {
        BitOp::Bt => None,
        BitOp::Bts => Some(b.emit_binop(BinOp::Or, val, mask)),
        BitOp::Btr => {
            let not_mask = b.emit_unop(UnOp::Not, mask, width);
            Some(b.emit_binop(BinOp::And, val, IrOperand::Value(not_mask)))
        }
        BitOp::Btc => Some(b.emit_binop(BinOp::Xor, val, mask)),
    };
    if let Some(v) = new_val {
        store_result(b, dst, IrOperand::Value(v), width, next_ip);
    }
}

/// LOCK XADD (spec.md §8 scenario 5): the atomic path exchanges the
/// pre-update value directly out of `AtomicFetchOp`'s return, matching
/// XADD's "dest += src; src = old dest" semantics without a second access.
fn lower_xadd(b: &mut IrBuilder, dst: &X86Operand, src: &X86Operand, lock: bool, width: Width, next_ip: u64) {
    let src_val = load_source(b, src, width, next_ip);
    if lock && dst.is_memory() {
        let addr = effective_address(b, dst, next_ip);
        let old = b.emit_atomic_fetch(addr, AtomicOp::Add, src_val, width);
        store_result(b, src, IrOperand::Value(old), width, next_ip);
        b.emit_set_deferred_flags(DeferredFlagKind::Add, width, IrOperand::Value(old), src_val);
        b.emit_fence();
    } else {
        let dst_val = load_source(b, dst, width, next_ip);
        let sum = b.emit_binop(BinOp::Add, dst_val, src_val);
        store_result(b, dst, IrOperand::Value(sum), width, next_ip);
        store_result(b, src, dst_val, width, next_ip);
        b.emit_set_deferred_flags(DeferredFlagKind::Add, width, dst_val, src_val);
    }
}

fn lower_xchg(b: &mut IrBuilder, a: &X86Operand, bop: &X86Operand, width: Width, next_ip: u64) {
    if a.is_memory() || bop.is_memory() {
        let (mem, reg) = if a.is_memory() { (a, bop) } else { (bop, a) };
        let addr = effective_address(b, mem, next_ip);
        let reg_val = load_source(b, reg, width, next_ip);
        let old = b.emit_atomic_fetch(addr, AtomicOp::Xchg, reg_val, width);
        store_result(b, reg, IrOperand::Value(old), width, next_ip);
    } else {
        let a_val = load_source(b, a, width, next_ip);
        let b_val = load_source(b, bop, width, next_ip);
        store_result(b, a, b_val, width, next_ip);
        store_result(b, bop, a_val, width, next_ip);
    }
}

/// CMPXCHG: compares the accumulator against `dst`; on match `dst` takes
/// `src`, on mismatch the accumulator takes `dst`'s current value. Both
/// outcomes are expressed with `Select` rather than a branch, since no
/// loop or side effect differs between the two paths besides which value
/// lands where.
fn lower_cmpxchg(b: &mut IrBuilder, dst: &X86Operand, src: &X86Operand, lock: bool, width: Width, next_ip: u64) {
    let acc_operand = reg_operand(Gpr::Rax, width);
    let acc_val = load_source(b, &acc_operand, width, next_ip);

    if lock && dst.is_memory() {
        let addr = effective_address(b, dst, next_ip);
        let src_val = load_source(b, src, width, next_ip);
        let old = b.emit_atomic_cas(addr, acc_val, src_val, width);
        let is_eq = IrOperand::Value(b.emit_binop(BinOp::Eq, IrOperand::Value(old), acc_val));
        let new_acc = b.emit_select(is_eq, acc_val, IrOperand::Value(old));
        store_result(b, &acc_operand, IrOperand::Value(new_acc), width, next_ip);
        b.emit_set_deferred_flags(DeferredFlagKind::Cmp, width, acc_val, IrOperand::Value(old));
    } else {
        let dst_val = load_source(b, dst, width, next_ip);
        let is_eq = IrOperand::Value(b.emit_binop(BinOp::Eq, acc_val, dst_val));
        let src_val = load_source(b, src, width, next_ip);
        let new_dst = b.emit_select(is_eq, src_val, dst_val);
        store_result(b, dst, IrOperand::Value(new_dst), width, next_ip);
        let new_acc = b.emit_select(is_eq, acc_val, dst_val);
        store_result(b, &acc_operand, IrOperand::Value(new_acc), width, next_ip);
        b.emit_set_deferred_flags(DeferredFlagKind::Cmp, width, acc_val, dst_val);
    }
}

/// String ops (spec.md §4.3): MOVS/STOS collapse to the whole-buffer
/// `MemCpy`/`MemSet` ops; CMPS/SCAS need a per-element comparison and early
/// exit, so they materialize a real loop via `BranchIf`. Direction is
/// simplified to always-forward (documented in DESIGN.md) since `MemCpy`/
/// `MemSet`'s `backward` field is a compile-time bool and `DF` is a
/// runtime value.
fn lower_string_op(b: &mut IrBuilder, op: StringOp, rep: RepPrefix, width: Width, next_ip: u64) -> Result<(), LowerError> {
    let has_rep = !matches!(rep, RepPrefix::None);
    let count = if has_rep {
        IrOperand::Value(b.emit_load_reg(Gpr::Rcx, Width::W64))
    } else {
        IrOperand::Const(1)
    };
    let delta = IrOperand::Value(b.emit_binop(BinOp::Mul, count, IrOperand::Const(u64::from(width.bytes()))));

    match op {
        StringOp::Movs => {
            let rsi = IrOperand::Value(b.emit_load_reg(Gpr::Rsi, Width::W64));
            let rdi = IrOperand::Value(b.emit_load_reg(Gpr::Rdi, Width::W64));
            b.emit_mem_copy(rdi, rsi, count, width, false);
            let new_rsi = b.emit_binop(BinOp::Add, rsi, delta);
            let new_rdi = b.emit_binop(BinOp::Add, rdi, delta);
            b.emit_store_reg(Gpr::Rsi, IrOperand::Value(new_rsi), Width::W64);
            b.emit_store_reg(Gpr::Rdi, IrOperand::Value(new_rdi), Width::W64);
            if has_rep {
                b.emit_store_reg(Gpr::Rcx, IrOperand::Const(0), Width::W64);
            }
        }
        StringOp::Stos => {
            let rax = IrOperand::Value(b.emit_load_reg(Gpr::Rax, Width::W64));
            let val = IrOperand::Value(b.emit_bfe(rax, 0, width.bits() as u8, false));
            let rdi = IrOperand::Value(b.emit_load_reg(Gpr::Rdi, Width::W64));
            b.emit_mem_set(rdi, val, count, width, false);
            let new_rdi = b.emit_binop(BinOp::Add, rdi, delta);
            b.emit_store_reg(Gpr::Rdi, IrOperand::Value(new_rdi), Width::W64);
            if has_rep {
                b.emit_store_reg(Gpr::Rcx, IrOperand::Const(0), Width::W64);
            }
        }
        StringOp::Lods => {
            let rsi = IrOperand::Value(b.emit_load_reg(Gpr::Rsi, Width::W64));
            let one_before_end = b.emit_binop(BinOp::Sub, delta, IrOperand::Const(u64::from(width.bytes())));
            let last_addr = b.emit_binop(BinOp::Add, rsi, IrOperand::Value(one_before_end));
            let val = b.emit_load_mem(IrOperand::Value(last_addr), width, MemOrder::Tso);
            store_result(b, &reg_operand(Gpr::Rax, width), IrOperand::Value(val), width, next_ip);
            let new_rsi = b.emit_binop(BinOp::Add, rsi, delta);
            b.emit_store_reg(Gpr::Rsi, IrOperand::Value(new_rsi), Width::W64);
            if has_rep {
                b.emit_store_reg(Gpr::Rcx, IrOperand::Const(0), Width::W64);
            }
        }
        StringOp::Scas | StringOp::Cmps => lower_string_compare_loop(b, op, rep, width, next_ip)?,
    }
    Ok(())
}

fn lower_string_compare_loop(
    b: &mut IrBuilder,
    op: StringOp,
    rep: RepPrefix,
    width: Width,
    next_ip: u64,
) -> Result<(), LowerError> {
    if matches!(rep, RepPrefix::None) {
        compare_one_iteration(b, op, width);
        return Ok(());
    }

    let current = b.current_block();
    let header = b.new_block();
    let body = b.new_block();
    let after = b.new_block();
    b.terminate(current, Terminator::Jump { target: header })?;

    b.set_current(header);
    let rcx = b.emit_load_reg(Gpr::Rcx, Width::W64);
    let ne_zero = b.emit_binop(BinOp::Ne, IrOperand::Value(rcx), IrOperand::Const(0));
    b.terminate(header, Terminator::BranchIf { cond: IrOperand::Value(ne_zero), if_true: body, if_false: after })?;

    b.set_current(body);
    compare_one_iteration(b, op, width);
    b.materialize_deferred_flags();
    let rcx_dec = b.emit_binop(BinOp::Sub, IrOperand::Value(rcx), IrOperand::Const(1));
    b.emit_store_reg(Gpr::Rcx, IrOperand::Value(rcx_dec), Width::W64);
    let zf = b.emit_load_flag(ArchFlag::Zf);
    let cont = match rep {
        RepPrefix::Rep => IrOperand::Value(zf),
        RepPrefix::Repne => IrOperand::Value(b.emit_binop(BinOp::Eq, IrOperand::Value(zf), IrOperand::Const(0))),
        RepPrefix::None => unreachable!("handled above"),
    };
    b.terminate(body, Terminator::BranchIf { cond: cont, if_true: header, if_false: after })?;

    b.set_current(after);
    let _ = next_ip;
    Ok(())
}

fn compare_one_iteration(b: &mut IrBuilder, op: StringOp, width: Width) {
    let delta = IrOperand::Const(u64::from(width.bytes()));
    match op {
        StringOp::Scas => {
            let rax = IrOperand::Value(b.emit_load_reg(Gpr::Rax, Width::W64));
            let acc = IrOperand::Value(b.emit_bfe(rax, 0, width.bits() as u8, false));
            let rdi = IrOperand::Value(b.emit_load_reg(Gpr::Rdi, Width::W64));
            let val = IrOperand::Value(b.emit_load_mem(rdi, width, MemOrder::Tso));
            b.emit_set_deferred_flags(DeferredFlagKind::Cmp, width, acc, val);
            let new_rdi = b.emit_binop(BinOp::Add, rdi, delta);
            b.emit_store_reg(Gpr::Rdi, IrOperand::Value(new_rdi), Width::W64);
        }
        StringOp::Cmps => {
            let rsi = IrOperand::Value(b.emit_load_reg(Gpr::Rsi, Width::W64));
            let rdi = IrOperand::Value(b.emit_load_reg(Gpr::Rdi, Width::W64));
            let src_val = IrOperand::Value(b.emit_load_mem(rsi, width, MemOrder::Tso));
            let dst_val = IrOperand::Value(b.emit_load_mem(rdi, width, MemOrder::Tso));
            b.emit_set_deferred_flags(DeferredFlagKind::Cmp, width, src_val, dst_val);
            let new_rsi = b.emit_binop(BinOp::Add, rsi, delta);
            let new_rdi = b.emit_binop(BinOp::Add, rdi, delta);
            b.emit_store_reg(Gpr::Rsi, IrOperand::Value(new_rsi), Width::W64);
            b.emit_store_reg(Gpr::Rdi, IrOperand::Value(new_rdi), Width::W64);
        }
        _ => unreachable!("only SCAS/CMPS materialize a compare loop"),
    }
}

fn lower_cpuid(b: &mut IrBuilder, next_ip: u64) {
    let eax = b.emit_load_reg(Gpr::Rax, Width::W64);
    let leaf = b.emit_bfe(IrOperand::Value(eax), 0, 32, false);
    let regs = b.emit_cpuid(IrOperand::Value(leaf));
    store_result(b, &reg_operand(Gpr::Rax, Width::W32), IrOperand::Value(regs[0]), Width::W32, next_ip);
    store_result(b, &reg_operand(Gpr::Rbx, Width::W32), IrOperand::Value(regs[1]), Width::W32, next_ip);
    store_result(b, &reg_operand(Gpr::Rcx, Width::W32), IrOperand::Value(regs[2]), Width::W32, next_ip);
    store_result(b, &reg_operand(Gpr::Rdx, Width::W32), IrOperand::Value(regs[3]), Width::W32, next_ip);
}

fn lower_rdtsc(b: &mut IrBuilder, next_ip: u64) {
    let tsc = b.emit_rdtsc();
    let lo = b.emit_bfe(IrOperand::Value(tsc), 0, 32, false);
    let hi = b.emit_bfe(IrOperand::Value(tsc), 32, 32, false);
    store_result(b, &reg_operand(Gpr::Rax, Width::W32), IrOperand::Value(lo), Width::W32, next_ip);
    store_result(b, &reg_operand(Gpr::Rdx, Width::W32), IrOperand::Value(hi), Width::W32, next_ip);
}

/// `Syscall(arg0..arg6, flags)` (spec.md §6): arguments come from the
/// Linux x86-64 ABI registers. The block always exits after a syscall
/// (spec.md §5 "suspension occurs only at a syscall op"), letting the
/// driver loop re-enter translated code at `next_ip` through the cache.
fn lower_syscall(b: &mut IrBuilder, next_ip: u64) -> Result<(), LowerError> {
    let number = IrOperand::Value(b.emit_load_reg(Gpr::Rax, Width::W64));
    let args = [
        IrOperand::Value(b.emit_load_reg(Gpr::Rdi, Width::W64)),
        IrOperand::Value(b.emit_load_reg(Gpr::Rsi, Width::W64)),
        IrOperand::Value(b.emit_load_reg(Gpr::Rdx, Width::W64)),
        IrOperand::Value(b.emit_load_reg(Gpr::R10, Width::W64)),
        IrOperand::Value(b.emit_load_reg(Gpr::R8, Width::W64)),
        IrOperand::Value(b.emit_load_reg(Gpr::R9, Width::W64)),
    ];
    let ret = b.emit_syscall(number, args);
    b.emit_store_reg(Gpr::Rax, IrOperand::Value(ret), Width::W64);
    let cur = b.current_block();
    b.terminate(cur, Terminator::ExitFunction { rip: IrOperand::Const(next_ip) })?;
    Ok(())
}

fn lower_int(b: &mut IrBuilder, vector: u8, next_ip: u64) -> Result<(), LowerError> {
    if vector == LINUX32_SYSCALL_VECTOR {
        return lower_syscall(b, next_ip);
    }
    let cur = b.current_block();
    b.terminate(
        cur,
        Terminator::Break { reason: BreakReason::Sigsegv, trap_number: u32::from(vector), si_code: 0, error_register: 0 },
    )?;
    Ok(())
}

fn lower_flag_write(b: &mut IrBuilder, op: FlagWriteOp) {
    match op {
        FlagWriteOp::Clc => {
            b.invalidate_deferred_flags();
            b.emit_store_flag_bit(ArchFlag::Cf, IrOperand::Const(0));
        }
        FlagWriteOp::Stc => {
            b.invalidate_deferred_flags();
            b.emit_store_flag_bit(ArchFlag::Cf, IrOperand::Const(1));
        }
        FlagWriteOp::Cmc => {
            b.invalidate_deferred_flags();
            let cf = b.emit_load_flag(ArchFlag::Cf);
            let flipped = b.emit_binop(BinOp::Xor, IrOperand::Value(cf), IrOperand::Const(1));
            b.emit_store_flag_bit(ArchFlag::Cf, IrOperand::Value(flipped));
        }
        FlagWriteOp::Cld => b.emit_store_flag_bit(ArchFlag::Df, IrOperand::Const(0)),
        FlagWriteOp::Std => b.emit_store_flag_bit(ArchFlag::Df, IrOperand::Const(1)),
    }
}
