//! The typed decoded-operand model (spec.md §3): "each operand variant is
//! one of: literal, direct GPR, GPR-indirect, SIB, RIP-relative."

use dbt_types::{Gpr, Width};
use iced_x86::{Instruction, Register};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// An immediate literal.
    Imm { width: Width, value: i64 },
    /// A register operand addressed directly (not through memory).
    Reg {
        reg: Gpr,
        width: Width,
        /// True for the legacy AH/CH/DH/BH high-byte encodings.
        high8: bool,
    },
    /// `[base + disp]` with no scaled index (ModRM-only memory form).
    Indirect { base: Option<Gpr>, disp: i64 },
    /// Full SIB addressing: `[base + index*scale + disp]`.
    Sib {
        base: Option<Gpr>,
        index: Option<Gpr>,
        scale: u8,
        disp: i64,
        /// Set when `index` names a vector register (AVX gather/scatter).
        vsib: bool,
    },
    /// `[rip + offset]`, already resolved to the post-instruction-relative
    /// encoding (spec.md §4.2: "sign-extended from 32 bits" in 64-bit
    /// mode; absolute in 32-bit mode, represented with `base: None` via
    /// [`Operand::Indirect`] instead).
    RipRelative { offset: i64 },
}

impl Operand {
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            Operand::Indirect { .. } | Operand::Sib { .. } | Operand::RipRelative { .. }
        )
    }
}

/// Map an `iced_x86::Register` to our `(Gpr, Width, is_high_byte)` triple.
/// Returns `None` for non-GPR registers (segment/vector/x87/etc).
#[must_use]
pub fn classify_gpr(reg: Register) -> Option<(Gpr, Width, bool)> {
    use Register::*;
    let high8 = matches!(reg, AH | CH | DH | BH);
    let width = match reg {
        AL | CL | DL | BL | AH | CH | DH | BH | SPL | BPL | SIL | DIL | R8L | R9L | R10L
        | R11L | R12L | R13L | R14L | R15L => Width::W8,
        AX | CX | DX | BX | SP | BP | SI | DI | R8W | R9W | R10W | R11W | R12W | R13W
        | R14W | R15W => Width::W16,
        EAX | ECX | EDX | EBX | ESP | EBP | ESI | EDI | R8D | R9D | R10D | R11D | R12D
        | R13D | R14D | R15D => Width::W32,
        RAX | RCX | RDX | RBX | RSP | RBP | RSI | RDI | R8 | R9 | R10 | R11 | R12 | R13
        | R14 | R15 => Width::W64,
        _ => return Option::None,
    };
    let gpr = match reg {
        AL | AH | AX | EAX | RAX => Gpr::Rax,
        CL | CH | CX | ECX | RCX => Gpr::Rcx,
        DL | DH | DX | EDX | RDX => Gpr::Rdx,
        BL | BH | BX | EBX | RBX => Gpr::Rbx,
        SPL | SP | ESP | RSP => Gpr::Rsp,
        BPL | BP | EBP | RBP => Gpr::Rbp,
        SIL | SI | ESI | RSI => Gpr::Rsi,
        DIL | DI | EDI | RDI => Gpr::Rdi,
        R8L | R8W | R8D | R8 => Gpr::R8,
        R9L | R9W | R9D | R9 => Gpr::R9,
        R10L | R10W | R10D | R10 => Gpr::R10,
        R11L | R11W | R11D | R11 => Gpr::R11,
        R12L | R12W | R12D | R12 => Gpr::R12,
        R13L | R13W | R13D | R13 => Gpr::R13,
        R14L | R14W | R14D | R14 => Gpr::R14,
        R15L | R15W | R15D | R15 => Gpr::R15,
        _ => return Option::None,
    };
    Some((gpr, width, high8))
}

/// Extract operand `index` (0-based) of a decoded instruction in our typed
/// model, given the instruction's effective operand width (for immediates
/// and bare register operands whose iced-x86 width already tells us the
/// answer, this parameter is only used as a fallback).
#[must_use]
pub fn extract_operand(ins: &Instruction, index: u32, op_width: Width) -> Operand {
    use iced_x86::OpKind;
    match ins.op_kind(index) {
        OpKind::Register => {
            let reg = ins.op_register(index);
            let (gpr, width, high8) = classify_gpr(reg).expect("non-GPR register operand");
            Operand::Reg { reg: gpr, width, high8 }
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::Imm {
            width: op_width,
            value: ins.immediate(index) as i64,
        },
        OpKind::Memory => extract_memory(ins),
        other => panic!("unsupported operand kind {other:?}"),
    }
}

fn extract_memory(ins: &Instruction) -> Operand {
    if ins.is_ip_rel_memory_operand() {
        // iced-x86 already folded `rip + disp` into an absolute target;
        // re-derive the relative offset from the post-instruction RIP so
        // the front end can re-add whatever RIP it materializes at
        // lowering time.
        let target = ins.ip_rel_memory_address();
        let next_rip = ins.next_ip();
        let offset = target.wrapping_sub(next_rip) as i64;
        return Operand::RipRelative { offset };
    }

    let base = classify_gpr(ins.memory_base()).map(|(g, _, _)| g);
    let index = classify_gpr(ins.memory_index()).map(|(g, _, _)| g);
    let disp = ins.memory_displacement64() as i64;

    if index.is_some() || ins.memory_index_scale() > 1 {
        Operand::Sib {
            base,
            index,
            scale: ins.memory_index_scale() as u8,
            disp,
            vsib: ins.is_vsib(),
        }
    } else {
        Operand::Indirect { base, disp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_decoder::{decode_one, DecodeMode};

    #[test]
    fn extracts_rip_relative_operand() {
        // 48 8B 05 78 56 34 12 => mov rax, qword ptr [rip+0x12345678]
        let bytes = [0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12];
        let decoded = decode_one(DecodeMode::Bits64, 0x1000, &bytes).unwrap();
        let op = extract_operand(&decoded.instruction, 1, Width::W64);
        assert_eq!(op, Operand::RipRelative { offset: 0x12345678 });
    }

    #[test]
    fn extracts_sib_operand() {
        // 48 8B 84 8B 78 56 34 12 => mov rax, [rbx+rcx*4+0x12345678]
        let bytes = [0x48, 0x8B, 0x84, 0x8B, 0x78, 0x56, 0x34, 0x12];
        let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).unwrap();
        let op = extract_operand(&decoded.instruction, 1, Width::W64);
        assert_eq!(
            op,
            Operand::Sib {
                base: Some(Gpr::Rbx),
                index: Some(Gpr::Rcx),
                scale: 4,
                disp: 0x12345678,
                vsib: false,
            }
        );
    }

    #[test]
    fn extracts_direct_register_operand() {
        // 48 01 C3 => add rbx, rax
        let bytes = [0x48, 0x01, 0xc3];
        let decoded = decode_one(DecodeMode::Bits64, 0, &bytes).unwrap();
        let dst = extract_operand(&decoded.instruction, 0, Width::W64);
        let src = extract_operand(&decoded.instruction, 1, Width::W64);
        assert_eq!(
            dst,
            Operand::Reg {
                reg: Gpr::Rbx,
                width: Width::W64,
                high8: false
            }
        );
        assert_eq!(
            src,
            Operand::Reg {
                reg: Gpr::Rax,
                width: Width::W64,
                high8: false
            }
        );
    }
}
