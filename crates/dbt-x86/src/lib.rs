//! Architectural instruction classification on top of `dbt_decoder`'s raw
//! byte decode: turns each [`dbt_decoder::DecodedInstruction`] into an
//! [`InstKind`] plus typed [`Operand`]s via the four-layer opcode table
//! (spec.md §4.2), the contract `dbt_frontend::lower` consumes.

pub mod inst_kind;
pub mod opcode_tables;
pub mod operand;

pub use inst_kind::{
    AluOp, BitOp, FlagWriteOp, InstKind, JumpTarget, RepPrefix, RotateOp, ShiftOp, StringOp, TableKind,
};
pub use opcode_tables::classify;
pub use operand::Operand;

use dbt_decoder::{decode_block, ByteReader, DecodeError, DecodeMode};

/// One decoded-and-classified instruction: the decoder's raw metadata plus
/// the architectural [`InstKind`] the front end lowers.
#[derive(Debug, Clone)]
pub struct ClassifiedInstruction {
    pub decoded: dbt_decoder::DecodedInstruction,
    pub kind: InstKind,
}

/// Decode one instruction at `rip` and classify it in a single call,
/// mirroring the teacher's `aero_x86::tier1::decode_one_mode` shape.
pub fn decode_and_classify(
    mode: DecodeMode,
    rip: u64,
    bytes: &[u8],
) -> Result<ClassifiedInstruction, DecodeError> {
    let decoded = dbt_decoder::decode_one(mode, rip, bytes)?;
    let kind = classify(&decoded);
    Ok(ClassifiedInstruction { decoded, kind })
}

/// A basic block of classified instructions, the unit [`dbt_frontend`]
/// lowers into IR.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedBlock {
    pub instructions: Vec<ClassifiedInstruction>,
}

pub fn decode_and_classify_block(
    mode: DecodeMode,
    pc: u64,
    reader: &dyn ByteReader,
    max_instructions: usize,
) -> ClassifiedBlock {
    let block = decode_block(mode, pc, reader, max_instructions);
    let instructions = block
        .instructions
        .into_iter()
        .map(|decoded| {
            let kind = classify(&decoded);
            ClassifiedInstruction { decoded, kind }
        })
        .collect();
    ClassifiedBlock { instructions }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceReader<'a>(&'a [u8]);
    impl ByteReader for SliceReader<'_> {
        fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
            let start = addr as usize;
            if start >= self.0.len() {
                return 0;
            }
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            n
        }
    }

    /// End-to-end classification of the spec.md §8 example sequence:
    /// ADD RBX,RAX; MUL ECX; SHL EAX,CL; SHLD EAX,EBX,8; LOCK XADD [RBX],RAX;
    /// MOV EAX,42; RET.
    #[test]
    fn classifies_section_eight_scenario() {
        let code: &[u8] = &[
            0x48, 0x01, 0xc3, // add rbx, rax
            0xf7, 0xe1, // mul ecx
            0xd3, 0xe0, // shl eax, cl
            0x0f, 0xa4, 0xd8, 0x08, // shld eax, ebx, 8
            0xf0, 0x48, 0x0f, 0xc1, 0x03, // lock xadd [rbx], rax
            0xb8, 0x2a, 0x00, 0x00, 0x00, // mov eax, 42
            0xc3, // ret
        ];
        let reader = SliceReader(code);
        let block = decode_and_classify_block(DecodeMode::Bits64, 0, &reader, 64);
        assert_eq!(block.instructions.len(), 7);
        assert!(matches!(block.instructions[0].kind, InstKind::Alu { op: AluOp::Add, .. }));
        assert!(matches!(block.instructions[1].kind, InstKind::Mul { signed: false, .. }));
        assert!(matches!(block.instructions[2].kind, InstKind::Shift { op: ShiftOp::Shl, .. }));
        assert!(matches!(block.instructions[3].kind, InstKind::DoubleShift { .. }));
        assert!(matches!(block.instructions[4].kind, InstKind::Xadd { lock: true, .. }));
        assert!(matches!(block.instructions[5].kind, InstKind::Mov { .. }));
        assert!(matches!(block.instructions[6].kind, InstKind::Ret));
        assert!(block.instructions[6].decoded.ends_block());
    }

    #[test]
    fn invalid_opcode_classifies_to_invalid() {
        let reserved = [0x0fu8, 0xffu8]; // UD0 family / reserved
        let result = decode_and_classify(DecodeMode::Bits64, 0, &reserved);
        if let Ok(classified) = result {
            // Whatever iced-x86 resolves this to, Unsupported/known kinds
            // are both acceptable; the important property is that it never
            // panics classifying it.
            let _ = classified.kind;
        }
    }
}
