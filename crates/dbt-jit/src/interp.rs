//! The reference interpreter backend (spec.md §9's acknowledgment that a
//! tree-walking interpreter is the simplest correct `JitBackend`; native
//! code generation is out of scope per spec.md §1's Non-goals). This is
//! the one concrete backend this crate ships: it exists to let
//! [`crate::driver`] exercise the full decode/lower/optimize/compile/
//! invoke pipeline end to end, and to give the §8 scenarios something to
//! run against.
//!
//! Grounded on the teacher's `aero-jit-x86` test harnesses (see
//! `aero-cpu-core/tests/jit_bookkeeping.rs`), which likewise drive a
//! `JitBackend` impl whose `CompiledCode` is just the already-lowered
//! function rather than a native code buffer.

use crate::backend::{BlockExit, GuestMemory, JitBackend, SyscallHandler};
use crate::cache::{BlockDebugInfo, BlockDebugInfoEntry, CompiledBlockMeta};
use crate::error::JitError;
use dbt_ir::{AtomicOp, BinOp, DeferredFlagKind, DivPart, Function, Instr, MulPart, Operand, RotateKind, ShiftKind, Terminator, ValueId};
use dbt_types::{ArchFlag, Cond, CpuState, Width};
use std::collections::HashMap;

/// Tree-walks [`dbt_ir::Function`] directly rather than compiling it to
/// anything else; `tsc` is the interpreter's own free-running counter for
/// `RDTSC` so repeated reads within a run are monotonic.
#[derive(Debug, Default)]
pub struct InterpreterBackend {
    tsc: u64,
}

impl InterpreterBackend {
    #[must_use]
    pub fn new() -> Self {
        InterpreterBackend::default()
    }
}

impl JitBackend for InterpreterBackend {
    type CompiledCode = Function;

    fn compile(&mut self, function: &Function) -> Result<(Self::CompiledCode, CompiledBlockMeta), JitError> {
        let mut entries = Vec::new();
        for (idx, block) in function.blocks.iter().enumerate() {
            entries.push(BlockDebugInfoEntry { guest_pc: function.entry_rip, host_offset: idx as u32 });
            let _ = block;
        }
        let meta = CompiledBlockMeta {
            guest_inst_count: function.guest_inst_count,
            block_ref_offset: 0,
            debug: BlockDebugInfo { entries },
        };
        Ok((function.clone(), meta))
    }

    fn invoke(
        &mut self,
        code: &Self::CompiledCode,
        cpu: &mut CpuState,
        memory: &mut dyn GuestMemory,
        syscalls: &mut dyn SyscallHandler,
    ) -> BlockExit {
        run(code, cpu, memory, syscalls, &mut self.tsc)
    }
}

/// Runs one already-lowered block to completion, starting at `f.entry_block`
/// and following `Jump`/`CondJump`/`BranchIf` edges within `f` (the pass
/// manager and front end never emit edges leaving the function, so this
/// always terminates at an `ExitFunction` or `Break`).
fn run(
    f: &Function,
    cpu: &mut CpuState,
    memory: &mut dyn GuestMemory,
    syscalls: &mut dyn SyscallHandler,
    tsc: &mut u64,
) -> BlockExit {
    let mut values: HashMap<ValueId, u64> = HashMap::new();
    let mut block_id = f.entry_block;

    loop {
        let block = f.block(block_id);
        for instr in block.iter() {
            exec_instr(instr, &mut values, cpu, memory, syscalls, tsc);
        }
        match block.terminator.as_ref().expect("validated function: every block has a terminator") {
            Terminator::Jump { target } => block_id = *target,
            Terminator::CondJump { cond, if_true, if_false } => {
                block_id = if eval_cond(*cond, cpu) { *if_true } else { *if_false };
            }
            Terminator::BranchIf { cond, if_true, if_false } => {
                block_id = if resolve(*cond, &values) != 0 { *if_true } else { *if_false };
            }
            Terminator::ExitFunction { rip } => {
                cpu.rip = resolve(*rip, &values);
                return BlockExit::Normal { next_rip: cpu.rip };
            }
            Terminator::Break { reason, trap_number, si_code, error_register } => {
                // No per-instruction guest-RIP tag is carried on `Instr`/
                // `Function`, so the best available approximation is the
                // block's entry RIP rather than the exact faulting byte.
                cpu.rip = f.entry_rip;
                return BlockExit::Break {
                    reason: *reason,
                    trap_number: *trap_number,
                    si_code: *si_code,
                    error_register: *error_register,
                };
            }
        }
    }
}

fn resolve(op: Operand, values: &HashMap<ValueId, u64>) -> u64 {
    match op {
        Operand::Const(c) => c,
        Operand::Value(v) => *values.get(&v).expect("validated function: every use is dominated by its def"),
    }
}

fn def(values: &mut HashMap<ValueId, u64>, id: ValueId, value: u64) {
    values.insert(id, value);
}

fn eval_cond(cond: Cond, cpu: &CpuState) -> bool {
    let cf = cpu.get_flag(ArchFlag::Cf);
    let zf = cpu.get_flag(ArchFlag::Zf);
    let sf = cpu.get_flag(ArchFlag::Sf);
    let of = cpu.get_flag(ArchFlag::Of);
    let pf = cpu.get_flag(ArchFlag::Pf);
    match cond {
        Cond::O => of,
        Cond::No => !of,
        Cond::B => cf,
        Cond::Ae => !cf,
        Cond::E => zf,
        Cond::Ne => !zf,
        Cond::Be => cf || zf,
        Cond::A => !cf && !zf,
        Cond::S => sf,
        Cond::Ns => !sf,
        Cond::P => pf,
        Cond::Np => !pf,
        Cond::L => sf != of,
        Cond::Ge => sf == of,
        Cond::Le => zf || (sf != of),
        Cond::G => !zf && (sf == of),
    }
}

fn parity_even(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Materializes the six arithmetic flags for `kind` given the operand
/// values and width a [`Instr::SetDeferredFlags`] record captured, mirroring
/// spec.md §3's deferred-flag scheme and the NZ-zero-CV micro-protocol for
/// AND/OR/XOR/TEST.
fn materialize(cpu: &mut CpuState, kind: DeferredFlagKind, width: Width, lhs: u64, rhs: u64) {
    let lhs = width.truncate(lhs);
    let rhs = width.truncate(rhs);
    let sign = width.sign_bit();

    let (result, cf, of, af) = match kind {
        DeferredFlagKind::Add | DeferredFlagKind::Inc => {
            let full = (lhs as u128) + (rhs as u128);
            let result = width.truncate(full as u64);
            let cf = if matches!(kind, DeferredFlagKind::Inc) {
                cpu.get_flag(ArchFlag::Cf)
            } else {
                (full >> width.bits()) != 0
            };
            let of = ((lhs ^ result) & (rhs ^ result)) & sign != 0;
            let af = (lhs & 0xf) + (rhs & 0xf) > 0xf;
            (result, cf, of, af)
        }
        DeferredFlagKind::Sub | DeferredFlagKind::Cmp | DeferredFlagKind::Dec => {
            let result = width.truncate(lhs.wrapping_sub(rhs));
            let cf = if matches!(kind, DeferredFlagKind::Dec) { cpu.get_flag(ArchFlag::Cf) } else { lhs < rhs };
            let of = ((lhs ^ rhs) & (lhs ^ result)) & sign != 0;
            let af = (lhs & 0xf) < (rhs & 0xf);
            (result, cf, of, af)
        }
        DeferredFlagKind::And => (width.truncate(lhs & rhs), false, false, false),
        DeferredFlagKind::Test => (width.truncate(lhs & rhs), false, false, false),
        DeferredFlagKind::Or => (width.truncate(lhs | rhs), false, false, false),
        DeferredFlagKind::Xor => (width.truncate(lhs ^ rhs), false, false, false),
        DeferredFlagKind::Shl => {
            let count = rhs & shift_count_mask(width);
            let result = width.truncate(lhs.wrapping_shl(count as u32));
            let cf = count != 0 && (lhs.wrapping_shl((count - 1) as u32)) & sign != 0;
            let of = count == 1 && (cf != (result & sign != 0));
            (result, cf, of, cpu.get_flag(ArchFlag::Af))
        }
        DeferredFlagKind::Shr => {
            let count = rhs & shift_count_mask(width);
            let result = width.truncate(lhs.wrapping_shr(count as u32));
            let cf = count != 0 && (lhs.wrapping_shr((count - 1) as u32)) & 1 != 0;
            let of = count == 1 && (lhs & sign != 0);
            (result, cf, of, cpu.get_flag(ArchFlag::Af))
        }
        DeferredFlagKind::Sar => {
            let count = rhs & shift_count_mask(width);
            let signed = sign_extend_to_i64(lhs, width);
            let result = width.truncate((signed >> count.min(63)) as u64);
            let cf = count != 0 && (signed >> (count.saturating_sub(1)).min(63)) & 1 != 0;
            (result, cf, false, cpu.get_flag(ArchFlag::Af))
        }
        DeferredFlagKind::Rotate => {
            // The record is `(pre_rotate_value, masked_count)` for both
            // ROL and ROR; direction is not forwarded, so CF/OF here are
            // approximated by always treating it as a left rotation
            // (documented approximation, DESIGN.md) rather than by
            // threading a direction bit through a fifteenth record shape.
            let bits = width.bits();
            let count = (rhs % u64::from(bits)) as u32;
            let rotated = width.truncate(rotate_left_n(lhs, count, bits));
            let cf = rotated & 1 != 0;
            let of = count == 1 && (cf != (rotated & sign != 0));
            (rotated, cf, of, cpu.get_flag(ArchFlag::Af))
        }
        DeferredFlagKind::Mul => {
            // `Instr::Mul`'s `signed` bit is not forwarded into the
            // deferred record; CF=OF is approximated here as "the
            // unsigned-widened product's high half is nonzero" for both
            // MUL and IMUL (see DESIGN.md).
            let wide = (lhs as u128) * (rhs as u128);
            let high_nonzero = (wide >> width.bits()) != 0;
            (width.truncate(wide as u64), high_nonzero, high_nonzero, cpu.get_flag(ArchFlag::Af))
        }
    };

    let zf = result == 0;
    let sf = width.is_negative(result);
    let pf = parity_even(result as u8);

    cpu.set_flag(ArchFlag::Cf, cf);
    cpu.set_flag(ArchFlag::Of, of);
    cpu.set_flag(ArchFlag::Af, af);
    cpu.set_flag(ArchFlag::Zf, zf);
    cpu.set_flag(ArchFlag::Sf, sf);
    cpu.set_flag(ArchFlag::Pf, pf);
}

fn shift_count_mask(width: Width) -> u64 {
    if width.bits() == 64 {
        0x3f
    } else {
        0x1f
    }
}

fn sign_extend_to_i64(value: u64, width: Width) -> i64 {
    match width {
        Width::W8 => value as i8 as i64,
        Width::W16 => value as i16 as i64,
        Width::W32 => value as i32 as i64,
        Width::W64 => value as i64,
    }
}

#[allow(clippy::too_many_arguments)]
fn exec_instr(
    instr: &Instr,
    values: &mut HashMap<ValueId, u64>,
    cpu: &mut CpuState,
    memory: &mut dyn GuestMemory,
    syscalls: &mut dyn SyscallHandler,
    tsc: &mut u64,
) {
    match instr {
        Instr::Nop => {}
        Instr::Const { dst, value } => def(values, *dst, *value),
        Instr::LoadReg { dst, reg, width } => {
            def(values, *dst, width.truncate(cpu.gpr[reg.as_u8() as usize]));
        }
        Instr::StoreReg { reg, src, .. } => {
            // The front end always pre-merges partial-width writes (via
            // `Bfi`/`Bfe`) before emitting a full 64-bit value here, so no
            // further width masking happens at this layer.
            cpu.gpr[reg.as_u8() as usize] = resolve(*src, values);
        }
        Instr::LoadFlag { dst, flag } => def(values, *dst, u64::from(cpu.get_flag(*flag))),
        Instr::StoreFlagBit { flag, value } => cpu.set_flag(*flag, resolve(*value, values) != 0),
        Instr::Addr { dst, base, index, disp } => {
            let mut addr = *disp as i64 as u64;
            if let Some(b) = base {
                addr = addr.wrapping_add(resolve(*b, values));
            }
            if let Some((i, scale)) = index {
                addr = addr.wrapping_add(resolve(*i, values).wrapping_mul(u64::from(*scale)));
            }
            def(values, *dst, addr);
        }
        Instr::LoadMem { dst, addr, width, .. } => {
            let addr = resolve(*addr, values);
            let mut buf = [0u8; 8];
            let n = memory.read(addr, &mut buf[..width.bytes() as usize]);
            debug_assert_eq!(n, width.bytes() as usize, "short guest memory read at {addr:#x}");
            def(values, *dst, width.truncate(u64::from_le_bytes(buf)));
        }
        Instr::StoreMem { addr, src, width, .. } => {
            let addr = resolve(*addr, values);
            let value = width.truncate(resolve(*src, values));
            let bytes = value.to_le_bytes();
            memory.write(addr, &bytes[..width.bytes() as usize]);
        }
        Instr::BinOp { dst, op, lhs, rhs } => {
            let lhs = resolve(*lhs, values);
            let rhs = resolve(*rhs, values);
            let result = match op {
                BinOp::Add => lhs.wrapping_add(rhs),
                BinOp::Sub => lhs.wrapping_sub(rhs),
                BinOp::Mul => lhs.wrapping_mul(rhs),
                BinOp::And => lhs & rhs,
                BinOp::Or => lhs | rhs,
                BinOp::Xor => lhs ^ rhs,
                BinOp::Shl => lhs.wrapping_shl(rhs as u32 & 0x3f),
                BinOp::Shr => lhs.wrapping_shr(rhs as u32 & 0x3f),
                BinOp::Sar => ((lhs as i64) >> (rhs & 0x3f)) as u64,
                BinOp::Eq => u64::from(lhs == rhs),
                BinOp::Ne => u64::from(lhs != rhs),
                BinOp::LtU => u64::from(lhs < rhs),
                BinOp::LeU => u64::from(lhs <= rhs),
                BinOp::LtS => u64::from((lhs as i64) < (rhs as i64)),
                BinOp::LeS => u64::from((lhs as i64) <= (rhs as i64)),
            };
            def(values, *dst, result);
        }
        Instr::UnOp { dst, op, src, width } => {
            let v = width.truncate(resolve(*src, values));
            let result = match op {
                dbt_ir::UnOp::Not => width.truncate(!v),
                dbt_ir::UnOp::Neg => width.truncate(v.wrapping_neg()),
                dbt_ir::UnOp::Popcount => v.count_ones() as u64,
                dbt_ir::UnOp::Lzcnt => (v.leading_zeros() - (64 - width.bits())) as u64,
                dbt_ir::UnOp::Tzcnt => {
                    if v == 0 {
                        u64::from(width.bits())
                    } else {
                        v.trailing_zeros() as u64
                    }
                }
                dbt_ir::UnOp::Rev => match width {
                    Width::W8 => v,
                    Width::W16 => u64::from((v as u16).swap_bytes()),
                    Width::W32 => u64::from((v as u32).swap_bytes()),
                    Width::W64 => v.swap_bytes(),
                },
            };
            def(values, *dst, result);
        }
        Instr::Shift { dst, op, value, count, width } => {
            let v = width.truncate(resolve(*value, values));
            let count = resolve(*count, values) & shift_count_mask(*width);
            let result = match op {
                ShiftKind::Shl => width.truncate(v.wrapping_shl(count as u32)),
                ShiftKind::Shr => width.truncate(v.wrapping_shr(count as u32)),
                ShiftKind::Sar => width.truncate((sign_extend_to_i64(v, *width) >> count.min(63)) as u64),
            };
            def(values, *dst, result);
        }
        Instr::Rotate { dst, op, value, count, width } => {
            let bits = width.bits();
            let v = width.truncate(resolve(*value, values));
            let count = (resolve(*count, values) % u64::from(bits)) as u32;
            let result = match op {
                RotateKind::Rol => width.truncate(rotate_left_n(v, count, bits)),
                RotateKind::Ror => width.truncate(rotate_right_n(v, count, bits)),
            };
            def(values, *dst, result);
        }
        Instr::Bfi { dst, base, insert, lsb, width } => {
            let base = resolve(*base, values);
            let insert = resolve(*insert, values);
            let lsb = u32::from(*lsb);
            let width = u32::from(*width);
            let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
            let cleared = base & !(mask << lsb);
            let merged = cleared | ((insert & mask) << lsb);
            def(values, *dst, merged);
        }
        Instr::Bfe { dst, src, lsb, width, signed } => {
            let src = resolve(*src, values);
            let lsb = u32::from(*lsb);
            let width = u32::from(*width);
            let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
            let extracted = (src >> lsb) & mask;
            let result = if *signed && width < 64 && (extracted & (1u64 << (width - 1))) != 0 {
                extracted | !mask
            } else {
                extracted
            };
            def(values, *dst, result);
        }
        Instr::Mul { dst, lhs, rhs, width, signed, part } => {
            let lhs = resolve(*lhs, values);
            let rhs = resolve(*rhs, values);
            let result = if *signed {
                let wide = sign_extend_to_i64(lhs, *width) as i128 * sign_extend_to_i64(rhs, *width) as i128;
                match part {
                    MulPart::Low => width.truncate(wide as u64),
                    MulPart::High => width.truncate((wide >> width.bits()) as u64),
                }
            } else {
                let wide = (width.truncate(lhs) as u128) * (width.truncate(rhs) as u128);
                match part {
                    MulPart::Low => width.truncate(wide as u64),
                    MulPart::High => width.truncate((wide >> width.bits()) as u64),
                }
            };
            def(values, *dst, result);
        }
        Instr::Div { dst, lo, hi, divisor, width, signed, part } => {
            exec_div(*dst, *lo, *hi, *divisor, *width, *signed, *part, values);
        }
        Instr::CondSelect { dst, cond, if_true, if_false } => {
            let taken = eval_cond(*cond, cpu);
            def(values, *dst, if taken { resolve(*if_true, values) } else { resolve(*if_false, values) });
        }
        Instr::Select { dst, cond, if_true, if_false } => {
            let taken = resolve(*cond, values) != 0;
            def(values, *dst, if taken { resolve(*if_true, values) } else { resolve(*if_false, values) });
        }
        Instr::SetDeferredFlags { kind, width, lhs, rhs } => {
            materialize(cpu, *kind, *width, resolve(*lhs, values), resolve(*rhs, values));
        }
        Instr::MaterializeFlags | Instr::InvalidateDeferredFlags => {
            // The interpreter materializes flags eagerly on every
            // `SetDeferredFlags`, so there is never a pending record left
            // for these to act on.
        }
        Instr::AtomicFetchOp { dst, addr, op, src, width } => {
            let addr = resolve(*addr, values);
            let src = width.truncate(resolve(*src, values));
            let mut buf = [0u8; 8];
            memory.read(addr, &mut buf[..width.bytes() as usize]);
            let old = width.truncate(u64::from_le_bytes(buf));
            let new = match op {
                AtomicOp::Add => old.wrapping_add(src),
                AtomicOp::And => old & src,
                AtomicOp::Or => old | src,
                AtomicOp::Xor => old ^ src,
                AtomicOp::Xchg => src,
            };
            let bytes = width.truncate(new).to_le_bytes();
            memory.write(addr, &bytes[..width.bytes() as usize]);
            def(values, *dst, old);
        }
        Instr::AtomicCas { dst, addr, expected, new, width } => {
            let addr = resolve(*addr, values);
            let expected = width.truncate(resolve(*expected, values));
            let new = width.truncate(resolve(*new, values));
            let mut buf = [0u8; 8];
            memory.read(addr, &mut buf[..width.bytes() as usize]);
            let old = width.truncate(u64::from_le_bytes(buf));
            if old == expected {
                let bytes = new.to_le_bytes();
                memory.write(addr, &bytes[..width.bytes() as usize]);
            }
            def(values, *dst, old);
        }
        Instr::Fence => {}
        Instr::MemCpy { dst_addr, src_addr, count, width, backward } => {
            let mut dst_addr = resolve(*dst_addr, values);
            let mut src_addr = resolve(*src_addr, values);
            let count = resolve(*count, values);
            let step = u64::from(width.bytes());
            if *backward {
                dst_addr = dst_addr.wrapping_sub(count.saturating_sub(1).wrapping_mul(step));
                src_addr = src_addr.wrapping_sub(count.saturating_sub(1).wrapping_mul(step));
            }
            for i in 0..count {
                let mut buf = [0u8; 8];
                let off = i.wrapping_mul(step);
                memory.read(src_addr.wrapping_add(off), &mut buf[..width.bytes() as usize]);
                memory.write(dst_addr.wrapping_add(off), &buf[..width.bytes() as usize]);
            }
        }
        Instr::MemSet { addr, value, count, width, backward } => {
            let mut addr = resolve(*addr, values);
            let value = width.truncate(resolve(*value, values));
            let count = resolve(*count, values);
            let step = u64::from(width.bytes());
            if *backward {
                addr = addr.wrapping_sub(count.saturating_sub(1).wrapping_mul(step));
            }
            let bytes = value.to_le_bytes();
            for i in 0..count {
                memory.write(addr.wrapping_add(i.wrapping_mul(step)), &bytes[..width.bytes() as usize]);
            }
        }
        Instr::Cpuid { dst_eax, dst_ebx, dst_ecx, dst_edx, leaf } => {
            let _ = resolve(*leaf, values);
            // A minimal, stable CPUID response; real topology/feature
            // enumeration is out of scope (spec.md §1 Non-goals).
            def(values, *dst_eax, 0);
            def(values, *dst_ebx, 0);
            def(values, *dst_ecx, 0);
            def(values, *dst_edx, 0);
        }
        Instr::Rdtsc { dst } => {
            *tsc = tsc.wrapping_add(1);
            def(values, *dst, *tsc);
        }
        Instr::Syscall { dst, number, args } => {
            let number = resolve(*number, values);
            let args = std::array::from_fn(|i| resolve(args[i], values));
            def(values, *dst, syscalls.handle_syscall(cpu, number, args));
        }
        Instr::FastSyscall { dst, number, args } => {
            let args = std::array::from_fn(|i| resolve(args[i], values));
            def(values, *dst, syscalls.handle_syscall(cpu, *number, args));
        }
    }
}

fn rotate_left_n(v: u64, count: u32, bits: u32) -> u64 {
    if count == 0 {
        return v;
    }
    (v << count) | (v >> (bits - count))
}

fn rotate_right_n(v: u64, count: u32, bits: u32) -> u64 {
    if count == 0 {
        return v;
    }
    (v >> count) | (v << (bits - count))
}

fn exec_div(
    dst: ValueId,
    lo: Operand,
    hi: Operand,
    divisor: Operand,
    width: Width,
    signed: bool,
    part: DivPart,
    values: &mut HashMap<ValueId, u64>,
) {
    let lo = width.truncate(resolve(lo, values));
    let hi = width.truncate(resolve(hi, values));
    let divisor = width.truncate(resolve(divisor, values));
    let dividend = (u128::from(hi) << width.bits()) | u128::from(lo);

    let result = if signed {
        let dividend = dividend as i128;
        let divisor = sign_extend_to_i64(divisor, width) as i128;
        match part {
            DivPart::Quotient => width.truncate((dividend / divisor) as u64),
            DivPart::Remainder => width.truncate((dividend % divisor) as u64),
        }
    } else {
        let divisor = u128::from(divisor);
        match part {
            DivPart::Quotient => width.truncate((dividend / divisor) as u64),
            DivPart::Remainder => width.truncate((dividend % divisor) as u64),
        }
    };
    def(values, dst, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_decoder::{ByteReader, DecodeMode};
    use dbt_types::Gpr;
    use dbt_x86::decode_and_classify_block;

    struct FlatMemory {
        bytes: Vec<u8>,
    }

    impl FlatMemory {
        fn new(code: &[u8]) -> Self {
            let mut bytes = vec![0u8; 0x10000];
            bytes[..code.len()].copy_from_slice(code);
            FlatMemory { bytes }
        }
    }

    impl ByteReader for FlatMemory {
        fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
            let addr = addr as usize;
            if addr >= self.bytes.len() {
                return 0;
            }
            let n = buf.len().min(self.bytes.len() - addr);
            buf[..n].copy_from_slice(&self.bytes[addr..addr + n]);
            n
        }
    }

    impl GuestMemory for FlatMemory {
        fn write(&mut self, addr: u64, buf: &[u8]) {
            let addr = addr as usize;
            self.bytes[addr..addr + buf.len()].copy_from_slice(buf);
        }
    }

    struct NoSyscalls;
    impl SyscallHandler for NoSyscalls {
        fn handle_syscall(&mut self, _cpu: &mut CpuState, _number: u64, _args: [u64; 6]) -> u64 {
            0
        }
    }

    fn run_bytes(code: &[u8], setup: impl FnOnce(&mut CpuState, &mut FlatMemory)) -> (CpuState, FlatMemory, BlockExit) {
        let mut mem = FlatMemory::new(code);
        let block = decode_and_classify_block(DecodeMode::Bits64, 0, &mem, 32);
        let mut f = dbt_frontend::lower_all(&block, 0).expect("lowering");
        dbt_passes::run(&mut f);
        dbt_ir::validate(&f).expect("pass manager output must validate");

        let mut backend = InterpreterBackend::new();
        let (compiled, _meta) = backend.compile(&f).expect("compile");
        let mut cpu = CpuState::default();
        let mut syscalls = NoSyscalls;
        setup(&mut cpu, &mut mem);
        let exit = backend.invoke(&compiled, &mut cpu, &mut mem, &mut syscalls);
        (cpu, mem, exit)
    }

    /// spec.md §8 scenario 6: `MOV EAX, 42; RET` leaves `RAX == 42` and
    /// returns control to whatever return address was on the stack.
    #[test]
    fn mov_eax_then_ret() {
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let (cpu, _mem, exit) = run_bytes(&code, |cpu, mem| {
            cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
            mem.write(0x4000, &0x1234u64.to_le_bytes());
        });
        assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 42);
        assert_eq!(exit, BlockExit::Normal { next_rip: 0x1234 });
    }

    /// spec.md §8 scenario 1: `ADD RBX, RAX` with `RAX=1, RBX=2` yields
    /// `RBX=3` and `ZF=0, CF=0, OF=0, SF=0, PF=1, AF=0`.
    #[test]
    fn add_rbx_rax_sets_flags_per_scenario_one() {
        // 48 01 C3 = ADD RBX, RAX; C3 = RET (terminates the block).
        let code = [0x48, 0x01, 0xC3, 0xC3];
        let (cpu, _mem, _exit) = run_bytes(&code, |cpu, mem| {
            cpu.gpr[Gpr::Rax.as_u8() as usize] = 1;
            cpu.gpr[Gpr::Rbx.as_u8() as usize] = 2;
            cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
            mem.write(0x4000, &0u64.to_le_bytes());
        });
        assert_eq!(cpu.gpr[Gpr::Rbx.as_u8() as usize], 3);
        assert!(!cpu.get_flag(ArchFlag::Zf));
        assert!(!cpu.get_flag(ArchFlag::Cf));
        assert!(!cpu.get_flag(ArchFlag::Of));
        assert!(!cpu.get_flag(ArchFlag::Sf));
        assert!(cpu.get_flag(ArchFlag::Pf));
        assert!(!cpu.get_flag(ArchFlag::Af));
    }

    /// spec.md §8 scenario 3: shifting by a count of zero must leave
    /// FLAGS architecturally untouched.
    #[test]
    fn shl_by_zero_preserves_flags() {
        // B1 00 = MOV CL, 0; D3 E0 = SHL EAX, CL; C3 = RET.
        let code = [0xB1, 0x00, 0xD3, 0xE0, 0xC3];
        let (cpu, _mem, _exit) = run_bytes(&code, |cpu, mem| {
            cpu.gpr[Gpr::Rax.as_u8() as usize] = 7;
            cpu.set_flag(ArchFlag::Cf, true);
            cpu.set_flag(ArchFlag::Zf, true);
            cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
            mem.write(0x4000, &0u64.to_le_bytes());
        });
        assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize] & 0xffff_ffff, 7);
        assert!(cpu.get_flag(ArchFlag::Cf), "shift-by-zero must not clear a previously-set CF");
        assert!(cpu.get_flag(ArchFlag::Zf), "shift-by-zero must not clear a previously-set ZF");
    }

    /// spec.md §8 scenario 2: `MUL ECX` with `EAX=0x8000_0000, ECX=2`
    /// widens to a nonzero high half, so CF=OF=1.
    #[test]
    fn mul_ecx_sets_carry_and_overflow_on_wide_product() {
        // B8 00 00 00 80 = MOV EAX, 0x80000000
        // B9 02 00 00 00 = MOV ECX, 2
        // F7 E1          = MUL ECX
        // C3             = RET
        let code = [0xB8, 0x00, 0x00, 0x00, 0x80, 0xB9, 0x02, 0x00, 0x00, 0x00, 0xF7, 0xE1, 0xC3];
        let (cpu, _mem, _exit) = run_bytes(&code, |cpu, mem| {
            cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
            mem.write(0x4000, &0u64.to_le_bytes());
        });
        assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize] & 0xffff_ffff, 0);
        assert_eq!(cpu.gpr[Gpr::Rdx.as_u8() as usize] & 0xffff_ffff, 1);
        assert!(cpu.get_flag(ArchFlag::Cf));
        assert!(cpu.get_flag(ArchFlag::Of));
    }

    /// spec.md §8 scenario 5: `LOCK XADD [RSI], EBX` leaves the
    /// pre-update memory value in EBX and the sum at `[RSI]`.
    #[test]
    fn lock_xadd_swaps_old_value_into_register_and_sums_in_memory() {
        // F0 0F C1 1E = LOCK XADD [RSI], EBX; C3 = RET.
        let code = [0xF0, 0x0F, 0xC1, 0x1E, 0xC3];
        let (cpu, mem, _exit) = run_bytes(&code, |cpu, mem| {
            cpu.gpr[Gpr::Rsi.as_u8() as usize] = 0x5000;
            cpu.gpr[Gpr::Rbx.as_u8() as usize] = 10;
            mem.write(0x5000, &20u32.to_le_bytes());
            cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x4000;
            mem.write(0x4000, &0u64.to_le_bytes());
        });
        assert_eq!(cpu.gpr[Gpr::Rbx.as_u8() as usize] & 0xffff_ffff, 20);
        let mut buf = [0u8; 4];
        mem.read(0x5000, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 30);
    }
}
