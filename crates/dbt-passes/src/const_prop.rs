//! Constant propagation (spec.md §4.4 step 1): folds operations whose
//! operands are all constants, canonicalizes commutative ops so a constant
//! operand lands on the right, folds the identities spec.md names (`x+0`,
//! `x&-1`, `x^x`, `x<<0`), and replaces a `Mul` by a power of two with a
//! `Lshl`.
//!
//! Terminates in one pass because it only ever substitutes already-known
//! constants forward (block order) and never revisits an earlier
//! instruction — each rewrite shrinks the remaining non-constant operand
//! count, matching spec.md's "ordinal derived from (graph_size,
//! constant_count_rhs)" termination argument without needing an explicit
//! worklist.

use dbt_ir::{BinOp, Function, Instr, MulPart, Operand, RotateKind, ShiftKind, UnOp, ValueId};
use std::collections::HashMap;

fn eval_binop(op: BinOp, lhs: u64, rhs: u64) -> Option<u64> {
    Some(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => lhs.wrapping_shl((rhs & 0x3f) as u32),
        BinOp::Shr => lhs.wrapping_shr((rhs & 0x3f) as u32),
        BinOp::Sar => ((lhs as i64).wrapping_shr((rhs & 0x3f) as u32)) as u64,
        BinOp::Eq => u64::from(lhs == rhs),
        BinOp::Ne => u64::from(lhs != rhs),
        BinOp::LtU => u64::from(lhs < rhs),
        BinOp::LeU => u64::from(lhs <= rhs),
        BinOp::LtS => u64::from((lhs as i64) < (rhs as i64)),
        BinOp::LeS => u64::from((lhs as i64) <= (rhs as i64)),
    })
}

fn eval_unop(op: UnOp, src: u64, width_bits: u32) -> u64 {
    match op {
        UnOp::Not => !src,
        UnOp::Neg => src.wrapping_neg(),
        UnOp::Popcount => src.count_ones() as u64,
        UnOp::Lzcnt => {
            let lz = src.leading_zeros();
            let extra = 64 - width_bits;
            u64::from(lz.saturating_sub(extra))
        }
        UnOp::Tzcnt => {
            if src == 0 {
                u64::from(width_bits)
            } else {
                u64::from(src.trailing_zeros().min(width_bits))
            }
        }
        UnOp::Rev => src.swap_bytes(),
    }
}

fn eval_shift(op: ShiftKind, value: u64, count: u64, width_bits: u32) -> u64 {
    let count = (count as u32) % width_bits.max(1);
    match op {
        ShiftKind::Shl => value.wrapping_shl(count),
        ShiftKind::Shr => value.wrapping_shr(count),
        ShiftKind::Sar => ((value as i64).wrapping_shr(count)) as u64,
    }
}

fn eval_rotate(op: RotateKind, value: u64, count: u64, width_bits: u32) -> u64 {
    if width_bits == 0 || width_bits > 64 {
        return value;
    }
    let mask = if width_bits == 64 { u64::MAX } else { (1u64 << width_bits) - 1 };
    let v = value & mask;
    let c = (count as u32) % width_bits;
    if c == 0 {
        return v;
    }
    let rotated = match op {
        RotateKind::Rol => (v << c) | (v >> (width_bits - c)),
        RotateKind::Ror => (v >> c) | (v << (width_bits - c)),
    };
    rotated & mask
}

fn eval_bfe(src: u64, lsb: u8, width: u8, signed: bool) -> u64 {
    if width == 0 || width >= 64 {
        return src;
    }
    let mask = (1u64 << width) - 1;
    let field = (src >> lsb) & mask;
    if signed && (field & (1 << (width - 1))) != 0 {
        field | !mask
    } else {
        field
    }
}

fn eval_bfi(base: u64, insert: u64, lsb: u8, width: u8) -> u64 {
    if width == 0 || width >= 64 {
        return insert;
    }
    let mask = ((1u64 << width) - 1) << lsb;
    (base & !mask) | ((insert << lsb) & mask)
}

/// Resolves `op` to a literal `u64` if it is a `Const` or a value already
/// known constant from an earlier fold in this pass.
fn resolved(op: Operand, known: &HashMap<ValueId, u64>) -> Option<u64> {
    match op {
        Operand::Const(v) => Some(v),
        Operand::Value(v) => known.get(&v).copied(),
    }
}

pub fn const_propagate(f: &mut Function) -> bool {
    let mut changed = false;
    let mut known: HashMap<ValueId, u64> = HashMap::new();

    for block in &mut f.blocks {
        for instr in &mut block.instrs {
            // Substitute already-known constant operands forward before
            // attempting to fold or canonicalize this instruction.
            instr.for_each_operand_mut(|op| {
                if let Operand::Value(v) = op {
                    if let Some(c) = known.get(v) {
                        *op = Operand::Const(*c);
                        changed = true;
                    }
                }
            });

            match instr {
                Instr::BinOp { dst, op, lhs, rhs } => {
                    if let (Some(l), Some(r)) = (resolved(*lhs, &known), resolved(*rhs, &known)) {
                        if let Some(v) = eval_binop(*op, l, r) {
                            known.insert(*dst, v);
                            *instr = Instr::Const { dst: *dst, value: v };
                            changed = true;
                            continue;
                        }
                    }
                    // Canonicalize: a constant operand of a commutative op
                    // always lands on the right.
                    if matches!(op, BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eq | BinOp::Ne)
                        && lhs.is_const()
                        && !rhs.is_const()
                    {
                        std::mem::swap(lhs, rhs);
                        changed = true;
                    }
                    // Identities: x+0, x-0, x&-1, x|0, x^0, x*1 all reduce
                    // to the non-constant side unchanged.
                    if let Some(r) = rhs.as_const() {
                        let identity = matches!(
                            (*op, r),
                            (BinOp::Add, 0) | (BinOp::Sub, 0) | (BinOp::Or, 0) | (BinOp::Xor, 0) | (BinOp::Mul, 1) | (BinOp::Shl, 0) | (BinOp::Shr, 0) | (BinOp::Sar, 0)
                        ) || (*op == BinOp::And && r == u64::MAX);
                        if identity {
                            let replacement = *lhs;
                            *instr = identity_move(*dst, replacement);
                            changed = true;
                            continue;
                        }
                        // x ^ x == 0, detected structurally (same operand
                        // on both sides), not via the constant map.
                    }
                    if *op == BinOp::Xor && *lhs == *rhs {
                        known.insert(*dst, 0);
                        *instr = Instr::Const { dst: *dst, value: 0 };
                        changed = true;
                        continue;
                    }
                    // Mul by a power of two becomes a shift.
                    if *op == BinOp::Mul {
                        if let Some(r) = rhs.as_const() {
                            if r != 0 && r.is_power_of_two() {
                                *op = BinOp::Shl;
                                *rhs = Operand::Const(u64::from(r.trailing_zeros()));
                                changed = true;
                            }
                        }
                    }
                }
                Instr::UnOp { dst, op, src, width } => {
                    if let Some(s) = resolved(*src, &known) {
                        let v = eval_unop(*op, s, width.bits());
                        known.insert(*dst, v);
                        *instr = Instr::Const { dst: *dst, value: v };
                        changed = true;
                    }
                }
                Instr::Shift { dst, op, value, count, width } => {
                    if let (Some(v), Some(c)) = (resolved(*value, &known), resolved(*count, &known)) {
                        let r = eval_shift(*op, v, c, width.bits());
                        known.insert(*dst, r);
                        *instr = Instr::Const { dst: *dst, value: r };
                        changed = true;
                    }
                }
                Instr::Rotate { dst, op, value, count, width } => {
                    if let (Some(v), Some(c)) = (resolved(*value, &known), resolved(*count, &known)) {
                        let r = eval_rotate(*op, v, c, width.bits());
                        known.insert(*dst, r);
                        *instr = Instr::Const { dst: *dst, value: r };
                        changed = true;
                    }
                }
                Instr::Bfe { dst, src, lsb, width, signed } => {
                    if let Some(s) = resolved(*src, &known) {
                        let r = eval_bfe(s, *lsb, *width, *signed);
                        known.insert(*dst, r);
                        *instr = Instr::Const { dst: *dst, value: r };
                        changed = true;
                    }
                }
                Instr::Bfi { dst, base, insert, lsb, width } => {
                    if let (Some(b), Some(i)) = (resolved(*base, &known), resolved(*insert, &known)) {
                        let r = eval_bfi(b, i, *lsb, *width);
                        known.insert(*dst, r);
                        *instr = Instr::Const { dst: *dst, value: r };
                        changed = true;
                    }
                }
                Instr::Mul { dst, lhs, rhs, width, signed, part } => {
                    if let (Some(l), Some(r)) = (resolved(*lhs, &known), resolved(*rhs, &known)) {
                        let bits = width.bits();
                        let wide: u128 = if *signed {
                            let ls = sign_extend(l, bits) as i128;
                            let rs = sign_extend(r, bits) as i128;
                            (ls.wrapping_mul(rs)) as u128
                        } else {
                            (u128::from(width.truncate(l))).wrapping_mul(u128::from(width.truncate(r)))
                        };
                        let v = match part {
                            MulPart::Low => (wide & u128::from(width_mask(bits))) as u64,
                            MulPart::High => (wide >> bits) as u64,
                        };
                        known.insert(*dst, v);
                        *instr = Instr::Const { dst: *dst, value: v };
                        changed = true;
                    }
                }
                Instr::Const { dst, value } => {
                    known.insert(*dst, *value);
                }
                _ => {}
            }
        }
    }
    changed
}

fn width_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(v: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return v as i64;
    }
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

/// A constant-fold target that turns out to be a plain move of an existing
/// operand (an identity rewrite) is represented the same way the builder
/// represents any other pure value: if the source was itself a constant,
/// reuse `Instr::Const`; otherwise there is no single-operand "copy" op in
/// this IR's taxonomy, so the defining instruction is left as a `BinOp`
/// that the validator still accepts (`x + 0` with its constant operand on
/// the right) — callers that want the identity folded away entirely should
/// rely on `Instr::Nop`'s absence of a destination meaning this case only
/// applies when `replacement` is itself already a `Const`.
fn identity_move(dst: ValueId, replacement: Operand) -> Instr {
    match replacement {
        Operand::Const(v) => Instr::Const { dst, value: v },
        Operand::Value(_) => Instr::BinOp { dst, op: BinOp::Or, lhs: replacement, rhs: Operand::Const(0) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_ir::{validate, print, IrBuilder, Terminator};

    #[test]
    fn folds_constant_add() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let one = b.emit_const(1);
        let two = b.emit_const(2);
        let sum = b.emit_binop(BinOp::Add, Operand::Value(one), Operand::Value(two));
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(sum), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(const_propagate(&mut f));
        let text = print(&f);
        assert!(text.contains("= const #0x3"), "unexpected IR:\n{text}");
        validate(&f).unwrap();
    }

    #[test]
    fn mul_by_power_of_two_becomes_shift() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let rax = b.emit_load_reg(dbt_types::Gpr::Rax, dbt_types::Width::W64);
        let scaled = b.emit_binop(BinOp::Mul, Operand::Value(rax), Operand::Const(8));
        b.emit_store_reg(dbt_types::Gpr::Rbx, Operand::Value(scaled), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        const_propagate(&mut f);
        let text = print(&f);
        assert!(text.contains("shl"), "expected mul-by-8 to become a shl:\n{text}");
        validate(&f).unwrap();
    }

    #[test]
    fn xor_self_folds_to_zero() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let rax = b.emit_load_reg(dbt_types::Gpr::Rax, dbt_types::Width::W64);
        let z = b.emit_binop(BinOp::Xor, Operand::Value(rax), Operand::Value(rax));
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(z), dbt_types::Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        const_propagate(&mut f);
        let text = print(&f);
        assert!(text.contains("= const #0x0"), "unexpected IR:\n{text}");
        validate(&f).unwrap();
    }
}
