//! Byte-stream decoding (spec.md §4.2): turns guest bytes into
//! [`iced_x86::Instruction`]s plus the prefix/size metadata the rest of the
//! pipeline needs, and partitions a straight-line byte stream into guest
//! basic blocks.
//!
//! We intentionally depend on a proven, table-driven decoder backend
//! (`iced-x86`) to get broad ISA coverage immediately rather than
//! hand-rolling the four-layer opcode table described in spec.md §4.2 at
//! the raw-byte level; [`dbt_x86`] is what builds the *architectural*
//! four-layer dispatch (primary/secondary/group/VEX, keyed by
//! `iced_x86::Code`) on top of what this crate decodes.

use iced_x86::{Decoder, DecoderOptions, Instruction};
use thiserror::Error;

/// Architectural bitness the decoder should assume for default operand and
/// address sizes (spec.md §4.2: "default (4 in 64-bit mode, 4 or 2 in
/// 32-bit per current default)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Bits16,
    Bits32,
    Bits64,
}

impl DecodeMode {
    const fn iced_bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }
}

/// Maximum length of a single x86 instruction, architecturally fixed.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte sequence does not form any valid instruction (illegal
    /// opcode, invalid prefix combination, reserved encoding).
    #[error("invalid instruction encoding")]
    InvalidInstruction,
    /// Decoding ran off the end of the provided byte window before a
    /// complete instruction was recognized; distinct from
    /// `InvalidInstruction` because it means "give me more bytes", not
    /// "this can never decode" (spec.md §4.2 "Failure semantics").
    #[error("instruction decode truncated at end of input")]
    Truncated,
}

/// One decoded instruction plus the metadata spec.md §3 requires beyond
/// what `iced_x86::Instruction` already tracks for us.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    /// Guest program counter this instruction was decoded at.
    pub rip: u64,
    /// Effective operand size in bytes (2/4/8), per the legacy-prefix /
    /// REX.W rule in spec.md §4.2.
    pub operand_size: u32,
    /// Effective address size in bytes (2/4/8).
    pub address_size: u32,
    pub has_rep: bool,
    pub has_repne: bool,
    pub has_lock: bool,
    pub segment_override: Option<iced_x86::Register>,
}

impl DecodedInstruction {
    #[must_use]
    pub fn len(&self) -> u32 {
        self.instruction.len() as u32
    }

    /// Whether this instruction ends a decoded basic block: any branch,
    /// call, return, interrupt, halt or syscall (spec.md §4.2).
    #[must_use]
    pub fn ends_block(&self) -> bool {
        use iced_x86::FlowControl;
        !matches!(
            self.instruction.flow_control(),
            FlowControl::Next | FlowControl::Call // near CALL falls through to the next block at the driver level
        )
    }
}

fn default_operand_size(mode: DecodeMode) -> u32 {
    match mode {
        DecodeMode::Bits16 => 2,
        DecodeMode::Bits32 | DecodeMode::Bits64 => 4,
    }
}

/// Recover the effective operand size (spec.md §4.2's "2 if 0x66 and not
/// REX.W; 8 if REX.W; else default") from the *decoded* instruction rather
/// than by re-parsing raw prefix bytes: `iced-x86` already resolved
/// REX.W/0x66 into the concrete register width of each register operand,
/// so the first register or memory operand's width is the ground truth.
fn effective_operand_size(ins: &Instruction, mode: DecodeMode) -> u32 {
    for i in 0..ins.op_count() {
        let reg = ins.op_register(i);
        if reg != iced_x86::Register::None {
            let size = reg.size() as u32;
            if size > 0 {
                return size;
            }
        }
    }
    let mem = ins.memory_size().size() as u32;
    if mem > 0 {
        return mem;
    }
    default_operand_size(mode)
}

/// Recover the effective address size from the width of whichever GPR
/// forms the memory base/index, falling back to the decode mode's default
/// when the instruction has no memory operand.
fn effective_address_size(ins: &Instruction, mode: DecodeMode) -> u32 {
    let base = ins.memory_base();
    if base != iced_x86::Register::None {
        return base.size() as u32;
    }
    let index = ins.memory_index();
    if index != iced_x86::Register::None {
        return index.size() as u32;
    }
    match mode {
        DecodeMode::Bits16 => 2,
        DecodeMode::Bits32 => 4,
        DecodeMode::Bits64 => 8,
    }
}

/// Decode a single instruction at `rip` from `bytes`, mirroring the
/// teacher's `decode_one`: the caller is expected to hand in up to
/// [`MAX_INSTRUCTION_LEN`] bytes (more is harmless; fewer may produce
/// `Truncated` instead of `InvalidInstruction`).
pub fn decode_one(mode: DecodeMode, rip: u64, bytes: &[u8]) -> Result<DecodedInstruction, DecodeError> {
    let mut decoder = Decoder::with_ip(mode.iced_bitness(), bytes, rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::Truncated);
    }
    let ins = decoder.decode();
    if ins.is_invalid() {
        if bytes.len() < MAX_INSTRUCTION_LEN {
            return Err(DecodeError::Truncated);
        }
        return Err(DecodeError::InvalidInstruction);
    }

    let operand_size = effective_operand_size(&ins, mode);
    let address_size = effective_address_size(&ins, mode);

    Ok(DecodedInstruction {
        has_rep: ins.has_rep_prefix(),
        has_repne: ins.has_repne_prefix(),
        has_lock: ins.has_lock_prefix(),
        segment_override: match ins.segment_prefix() {
            iced_x86::Register::None => None,
            reg => Some(reg),
        },
        operand_size,
        address_size,
        rip,
        instruction: ins,
    })
}

/// Decode one instruction, surfacing failures the same way `decode_one`
/// does but without handing back the successful value — used by callers
/// (e.g. the fuzz/property tests) that only care whether a given byte
/// sequence is well-formed.
pub fn decode_instruction(mode: DecodeMode, rip: u64, bytes: &[u8]) -> Result<DecodedInstruction, DecodeError> {
    decode_one(mode, rip, bytes)
}

/// A straight-line run of decoded instructions ending at the first
/// block-terminating instruction or at `max_instructions`, whichever comes
/// first (spec.md §4.2 `decode_block`).
#[derive(Debug, Clone, Default)]
pub struct DecodedBlock {
    pub instructions: Vec<DecodedInstruction>,
}

impl DecodedBlock {
    #[must_use]
    pub fn entry_rip(&self) -> Option<u64> {
        self.instructions.first().map(|i| i.rip)
    }

    #[must_use]
    pub fn total_len(&self) -> u32 {
        self.instructions.iter().map(DecodedInstruction::len).sum()
    }
}

/// Byte source over guest memory; kept minimal (spec.md's memory accessor
/// is an external collaborator, §2) so the decoder has no opinion on how
/// guest memory is backed.
pub trait ByteReader {
    /// Read up to `buf.len()` bytes at `addr`, returning the number of
    /// bytes actually available (may be less than `buf.len()` at a page
    /// boundary, which the decoder treats as a truncation hazard).
    fn read(&self, addr: u64, buf: &mut [u8]) -> usize;
}

pub fn decode_block(
    mode: DecodeMode,
    pc: u64,
    reader: &dyn ByteReader,
    max_instructions: usize,
) -> DecodedBlock {
    let mut block = DecodedBlock::default();
    let mut cursor = pc;
    loop {
        if block.instructions.len() >= max_instructions {
            break;
        }
        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        let available = reader.read(cursor, &mut window);
        match decode_one(mode, cursor, &window[..available.max(1).min(window.len())]) {
            Ok(inst) => {
                let ends = inst.ends_block();
                cursor = cursor.wrapping_add(u64::from(inst.len()));
                block.instructions.push(inst);
                if ends {
                    break;
                }
            }
            Err(_) => {
                // The architectural handling of an invalid/truncated opcode
                // (raising SIGILL via the front end's `Break` op) happens
                // one layer up, once the decoded block is handed to
                // `dbt_x86`/`dbt_frontend`; here we simply stop the block.
                break;
            }
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_mov_eax_imm32() {
        // B8 2A 00 00 00 => mov eax, 42
        let bytes = [0xb8, 0x2a, 0x00, 0x00, 0x00];
        let dec = decode_one(DecodeMode::Bits64, 0x1000, &bytes).unwrap();
        assert_eq!(dec.len(), 5);
        assert!(!dec.ends_block());
    }

    #[test]
    fn ret_ends_block() {
        let bytes = [0xc3];
        let dec = decode_one(DecodeMode::Bits64, 0x1000, &bytes).unwrap();
        assert!(dec.ends_block());
    }

    #[test]
    fn truncated_window_is_an_error() {
        // A bare 3DNow! escape prefix with nothing following: too short to
        // ever resolve, regardless of what the caller intended to decode.
        let reserved = [0x0fu8, 0x0f];
        let err = decode_one(DecodeMode::Bits64, 0x1000, &reserved);
        assert!(err.is_err());
    }

    #[test]
    fn full_length_window_of_only_prefixes_is_invalid_not_truncated() {
        let bytes = [0x66u8; MAX_INSTRUCTION_LEN];
        assert_eq!(
            decode_instruction(DecodeMode::Bits64, 0, &bytes).unwrap_err(),
            DecodeError::InvalidInstruction
        );
    }

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

    #[test]
    fn decode_block_stops_at_ret() {
        // mov eax, 42 ; ret
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let reader = SliceReader(&code);
        let block = decode_block(DecodeMode::Bits64, 0, &reader, 64);
        assert_eq!(block.instructions.len(), 2);
        assert!(block.instructions[1].ends_block());
    }

    #[test]
    fn decode_block_stops_at_max_instructions() {
        let code = [0x90u8; 10]; // NOP * 10
        let reader = SliceReader(&code);
        let block = decode_block(DecodeMode::Bits64, 0, &reader, 3);
        assert_eq!(block.instructions.len(), 3);
    }
}
