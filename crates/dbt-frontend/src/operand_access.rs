//! `load_source`/`store_result` (spec.md §4.3): the operand-to-IR bridge
//! every `lower_*` handler goes through rather than hand-rolling address
//! arithmetic and GPR masking at each call site.

use dbt_ir::{IrBuilder, MemOrder, Operand as IrOperand};
use dbt_types::{Gpr, Width};
use dbt_x86::Operand as X86Operand;

/// Stack-pointer-relative accesses are exempt from TSO ordering (spec.md
/// §5: "Stack slots are exempt... because x86 semantics for stack-only
/// traffic do not require cross-thread ordering unless the address
/// escapes"). This crate does not yet track escape analysis, so it
/// conservatively applies the rule spec.md states as the common case:
/// any access based directly off RSP/RBP.
fn mem_order_for_base(base: Option<Gpr>) -> MemOrder {
    match base {
        Some(Gpr::Rsp) | Some(Gpr::Rbp) => MemOrder::NonTso,
        _ => MemOrder::Tso,
    }
}

fn sign_extend(value: i64, width: Width) -> u64 {
    match width {
        Width::W8 => value as i8 as i64 as u64,
        Width::W16 => value as i16 as i64 as u64,
        Width::W32 => value as i32 as i64 as u64,
        Width::W64 => value as u64,
    }
}

fn compute_addr(builder: &mut IrBuilder, base: Option<Gpr>, index: Option<(Gpr, u8)>, disp: i64) -> IrOperand {
    let base_val = base.map(|g| IrOperand::Value(builder.emit_load_reg(g, Width::W64)));
    let index_val = index.map(|(g, scale)| (IrOperand::Value(builder.emit_load_reg(g, Width::W64)), scale));
    IrOperand::Value(builder.emit_addr(base_val, index_val, disp))
}

/// Reads `operand`'s value at `width`, performing the GPR-indirect/SIB/
/// RIP-relative address computation and typed load spec.md §4.3
/// describes. `next_ip` is the guest address immediately after the
/// instruction being lowered, needed to resolve `RipRelative` operands to
/// an absolute address at lowering time.
pub fn load_source(builder: &mut IrBuilder, operand: &X86Operand, width: Width, next_ip: u64) -> IrOperand {
    match *operand {
        X86Operand::Imm { value, .. } => IrOperand::Const(sign_extend(value, width)),
        X86Operand::Reg { reg, high8, .. } => {
            let full = builder.emit_load_reg(reg, Width::W64);
            if high8 {
                IrOperand::Value(builder.emit_bfe(IrOperand::Value(full), 8, 8, false))
            } else {
                IrOperand::Value(builder.emit_bfe(IrOperand::Value(full), 0, width.bits() as u8, false))
            }
        }
        X86Operand::Indirect { base, disp } => {
            let addr = compute_addr(builder, base, None, disp);
            let order = mem_order_for_base(base);
            IrOperand::Value(builder.emit_load_mem(addr, width, order))
        }
        X86Operand::Sib { base, index, scale, disp, .. } => {
            let addr = compute_addr(builder, base, index.map(|i| (i, scale)), disp);
            let order = mem_order_for_base(base);
            IrOperand::Value(builder.emit_load_mem(addr, width, order))
        }
        X86Operand::RipRelative { offset } => {
            let addr = IrOperand::Const(next_ip.wrapping_add(offset as u64));
            IrOperand::Value(builder.emit_load_mem(addr, width, MemOrder::Tso))
        }
    }
}

/// Writes `value` (already at `width`'s bit pattern, upper bits
/// unspecified) into `operand`. GPR writes narrower than 64 bits preserve
/// the untouched upper bits except for the architectural 32-bit
/// zero-extension rule (spec.md §4.3).
pub fn store_result(builder: &mut IrBuilder, operand: &X86Operand, value: IrOperand, width: Width, next_ip: u64) {
    match *operand {
        X86Operand::Imm { .. } => unreachable!("an immediate is never a store destination"),
        X86Operand::Reg { reg, high8, .. } => {
            if high8 {
                let full = builder.emit_load_reg(reg, Width::W64);
                let merged = builder.emit_bfi(IrOperand::Value(full), value, 8, 8);
                builder.emit_store_reg(reg, IrOperand::Value(merged), Width::W64);
            } else if width == Width::W64 {
                builder.emit_store_reg(reg, value, Width::W64);
            } else if width == Width::W32 {
                // 32-bit writes zero-extend to the full 64-bit register.
                let masked = builder.emit_bfe(value, 0, 32, false);
                builder.emit_store_reg(reg, IrOperand::Value(masked), Width::W64);
            } else {
                let full = builder.emit_load_reg(reg, Width::W64);
                let merged = builder.emit_bfi(IrOperand::Value(full), value, 0, width.bits() as u8);
                builder.emit_store_reg(reg, IrOperand::Value(merged), Width::W64);
            }
        }
        X86Operand::Indirect { base, disp } => {
            let addr = compute_addr(builder, base, None, disp);
            let order = mem_order_for_base(base);
            builder.emit_store_mem(addr, value, width, order);
        }
        X86Operand::Sib { base, index, scale, disp, .. } => {
            let addr = compute_addr(builder, base, index.map(|i| (i, scale)), disp);
            let order = mem_order_for_base(base);
            builder.emit_store_mem(addr, value, width, order);
        }
        X86Operand::RipRelative { offset } => {
            let addr = IrOperand::Const(next_ip.wrapping_add(offset as u64));
            builder.emit_store_mem(addr, value, width, MemOrder::Tso);
        }
    }
}

/// Computes the effective address of `operand` without performing a load,
/// used by `LEA` which never dereferences its memory-form operand.
pub fn effective_address(builder: &mut IrBuilder, operand: &X86Operand, next_ip: u64) -> IrOperand {
    match *operand {
        X86Operand::Indirect { base, disp } => compute_addr(builder, base, None, disp),
        X86Operand::Sib { base, index, scale, disp, .. } => compute_addr(builder, base, index.map(|i| (i, scale)), disp),
        X86Operand::RipRelative { offset } => IrOperand::Const(next_ip.wrapping_add(offset as u64)),
        X86Operand::Reg { .. } | X86Operand::Imm { .. } => {
            unreachable!("LEA's source operand is always a memory form")
        }
    }
}
