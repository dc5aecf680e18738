//! The front end (spec.md §4.3, §4.5): turns a [`ClassifiedBlock`] into one
//! finished [`dbt_ir::Function`]. Ties together the operand bridge
//! ([`operand_access`]) and the per-`InstKind` dispatcher ([`lower`]).

mod lower;
mod operand_access;

pub use lower::LowerError;

use dbt_ir::{Function, IrBuilder, Operand, Terminator};
use dbt_x86::ClassifiedBlock;

/// Lowers every instruction of `block` into a single IR function entered
/// at `entry_rip`, matching the §4.5 pseudocode's `dispatcher.lower_all`
/// call. If the classified block ends without a natural terminator (the
/// decoder hit `max_instructions` before a block-ending instruction), a
/// synthesized `ExitFunction` to the address right after the last decoded
/// instruction closes it out.
pub fn lower_all(block: &ClassifiedBlock, entry_rip: u64) -> Result<Function, LowerError> {
    let mut builder = IrBuilder::new(entry_rip);
    let mut last_next_ip = entry_rip;

    for ci in &block.instructions {
        lower::lower(&mut builder, ci)?;
        last_next_ip = ci.decoded.rip + u64::from(ci.decoded.len());
    }

    let cur = builder.current_block();
    if !builder.function().block(cur).is_sealed() {
        builder.materialize_deferred_flags();
        builder.terminate(cur, Terminator::ExitFunction { rip: Operand::Const(last_next_ip) })?;
    }

    Ok(builder.finish())
}

/// Lowers a single classified instruction into `builder`'s currently open
/// block. Exposed for tests and for callers (e.g. a future inline-caching
/// driver) that build up a function instruction-by-instruction rather than
/// from a whole pre-decoded [`ClassifiedBlock`].
pub fn lower_one(builder: &mut IrBuilder, ci: &dbt_x86::ClassifiedInstruction) -> Result<(), LowerError> {
    lower::lower(builder, ci)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_decoder::DecodeMode;
    use dbt_ir::{print, validate, BlockId};
    use dbt_x86::decode_and_classify_block;

    struct SliceReader<'a>(&'a [u8]);
    impl dbt_decoder::ByteReader for SliceReader<'_> {
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

    fn lower_bytes(code: &[u8]) -> Function {
        let reader = SliceReader(code);
        let block = decode_and_classify_block(DecodeMode::Bits64, 0, &reader, 64);
        let f = lower_all(&block, 0).expect("lowering should not fail");
        validate(&f).expect("lowered function must be structurally valid");
        f
    }

    /// spec.md §8 scenario: `ADD RBX, RAX`.
    #[test]
    fn add_sets_deferred_flags_with_original_operands() {
        let f = lower_bytes(&[0x48, 0x01, 0xc3]);
        let text = print(&f);
        assert!(text.contains("set_deferred_flags add"), "unexpected IR:\n{text}");
    }

    /// spec.md §8 scenario: `MUL ECX` widens the result into EDX:EAX.
    #[test]
    fn mul_one_operand_writes_both_halves() {
        let f = lower_bytes(&[0xf7, 0xe1]);
        let text = print(&f);
        assert!(text.contains("mul"), "unexpected IR:\n{text}");
        assert!(text.contains("store_reg rdx"), "MUL must write the high half into RDX:\n{text}");
    }

    /// spec.md §8 scenario 3: `SHL EAX, CL` must leave FLAGS architecturally
    /// unchanged when CL == 0 — verified here structurally by checking the
    /// lowered function contains the zero-count guard's three-way split.
    #[test]
    fn shl_by_register_count_builds_a_zero_guard() {
        let f = lower_bytes(&[0xd3, 0xe0]);
        assert!(f.blocks.len() >= 4, "shift-by-register must split into guard/flag/join blocks");
        let text = print(&f);
        assert!(text.contains("branchif"), "unexpected IR:\n{text}");
    }

    /// spec.md §8 scenario 4: `SHLD EAX, EBX, 8`.
    #[test]
    fn shld_lowers_to_a_funnel_shift() {
        let f = lower_bytes(&[0x0f, 0xa4, 0xd8, 0x08]);
        let text = print(&f);
        assert!(text.contains("shift shl"), "unexpected IR:\n{text}");
        assert!(text.contains("bfe"), "unexpected IR:\n{text}");
    }

    /// spec.md §8 scenario 5: `LOCK XADD [RBX], RAX`.
    #[test]
    fn locked_xadd_uses_an_atomic_fetch_op() {
        let f = lower_bytes(&[0xf0, 0x48, 0x0f, 0xc1, 0x03]);
        let text = print(&f);
        assert!(text.contains("atomic_fetch add"), "unexpected IR:\n{text}");
    }

    /// spec.md §8 scenario 6: `MOV EAX, 42; RET`.
    #[test]
    fn mov_then_ret_exits_through_the_return_address() {
        let f = lower_bytes(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        let entry = f.entry_block;
        let term = f.block(entry).terminator.as_ref().expect("entry block must be sealed");
        assert!(matches!(term, Terminator::ExitFunction { .. }));
    }

    /// The full spec.md §8 scenario sequence lowers to a single valid
    /// function (ADD, MUL, SHL, SHLD, LOCK XADD, MOV, RET).
    #[test]
    fn full_section_eight_sequence_lowers_and_validates() {
        let code: &[u8] = &[
            0x48, 0x01, 0xc3, // add rbx, rax
            0xf7, 0xe1, // mul ecx
            0xd3, 0xe0, // shl eax, cl
            0x0f, 0xa4, 0xd8, 0x08, // shld eax, ebx, 8
            0xf0, 0x48, 0x0f, 0xc1, 0x03, // lock xadd [rbx], rax
            0xb8, 0x2a, 0x00, 0x00, 0x00, // mov eax, 42
            0xc3, // ret
        ];
        let f = lower_bytes(code);
        for (i, _) in f.blocks.iter().enumerate() {
            let id = BlockId(i as u32);
            assert!(f.block(id).is_sealed(), "block {i} left unsealed");
        }
    }

    /// A block that runs out of instructions before hitting a natural
    /// terminator (max_instructions cap) gets a synthesized exit.
    #[test]
    fn capped_straight_line_code_gets_a_synthesized_exit() {
        let code: &[u8] = &[0x90, 0x90, 0x90, 0x90]; // nop*4, no terminator
        let reader = SliceReader(code);
        // max_instructions == the real instruction count, so decode_block
        // stops at the cap rather than reading truncated/phantom bytes
        // past the buffer.
        let block = decode_and_classify_block(DecodeMode::Bits64, 0x1000, &reader, 4);
        let f = lower_all(&block, 0x1000).unwrap();
        validate(&f).expect("synthesized exit must still validate");
        let entry = f.entry_block;
        let term = f.block(entry).terminator.as_ref().unwrap();
        assert_eq!(*term, Terminator::ExitFunction { rip: Operand::Const(0x1004) });
    }

    /// Divide-by-zero must not fall through to the division itself.
    #[test]
    fn div_by_zero_guard_branches_before_dividing() {
        // mov ecx, 0 ; div ecx
        let code: &[u8] = &[0xb9, 0x00, 0x00, 0x00, 0x00, 0xf7, 0xf1];
        let f = lower_bytes(code);
        let text = print(&f);
        assert!(text.contains("branchif"), "div must guard against a zero divisor:\n{text}");
        assert!(text.contains("break sigfpe"), "unexpected IR:\n{text}");
    }
}
