//! The guest architectural register file (spec.md §3, "Thread state" /
//! "CPUState"). This is a plain-old-data struct: the decoder, front end,
//! pass manager and JIT driver all address slots of it by a fixed byte
//! offset (a "context slot", per the glossary), so its layout is part of
//! the ABI the generated code is written against.
//!
//! The byte offsets are exposed as `CPU_*_OFF` constants (and the whole
//! size/alignment as `CPU_STATE_SIZE`/`CPU_STATE_ALIGN`) the same way the
//! teacher crate exposes them, so a host backend can hard-code field
//! addresses into emitted loads/stores without depending on this crate's
//! `#[repr]` at codegen time.

use std::sync::LazyLock;

/// One of the 17 architectural flag bits tracked per-byte rather than
/// packed into a single machine word, so the deferred-flag scheme
/// (spec.md §3) can invalidate individual bytes independently of the
/// others without a read-modify-write on a shared word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArchFlag {
    Cf = 0,
    Reserved1 = 1,
    Pf = 2,
    Reserved3 = 3,
    Af = 4,
    Reserved5 = 5,
    Zf = 6,
    Sf = 7,
    Tf = 8,
    If = 9,
    Df = 10,
    Of = 11,
    Iopl0 = 12,
    Iopl1 = 13,
    Nt = 14,
    Reserved15 = 15,
    Rf = 16,
}

pub const ARCH_FLAG_COUNT: usize = 17;

/// Bit position within a packed `RFLAGS`-style word, used only for the
/// convenience `rflags_snapshot`/`load_rflags` pack/unpack pair (the
/// byte-per-flag array in [`CpuState::flags`] is the ground truth).
const ARCH_FLAG_BIT: [u8; ARCH_FLAG_COUNT] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

/// A cached segment descriptor: the selector index as loaded by the guest
/// plus the linear base address the front end adds to effective addresses
/// computed under that segment (spec.md §4.3 `get_segment`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentState {
    pub selector: u16,
    pub base: u64,
}

/// The full guest architectural state for one thread.
///
/// Field order matters: it determines the `CPU_*_OFF` constants below via
/// [`std::mem::offset_of`], mirroring the way the teacher's
/// `aero-jit-x86::abi` module is kept in lockstep with
/// `aero-cpu-core::state::CpuState` (see `tests/abi.rs` in the retrieval
/// pack) rather than hand-duplicating offsets.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    /// 16 general-purpose 64-bit registers, indexed by [`crate::Gpr::as_u8`].
    pub gpr: [u64; 16],
    /// 16 vector registers; 128 bits wide in the baseline configuration,
    /// stored as two `u64` lanes (spec.md §3 allows optional widening to
    /// 256 bits, not implemented here — see DESIGN.md).
    pub xmm: [[u64; 2]; 16],
    pub rip: u64,
    /// Byte-per-flag array for the 17 architectural flags (spec.md §3).
    pub flags: [u8; ARCH_FLAG_COUNT],
    /// Deferred-flag scratch: which op produced the pending flags, its
    /// operand width, and the two operand values needed to recompute them.
    /// Kept as part of `CpuState` rather than as IR values (per the design
    /// note in spec.md §9) so it survives host register allocation.
    pub deferred_flag_kind: u8,
    pub deferred_flag_width: u8,
    pub deferred_flag_lhs: u64,
    pub deferred_flag_rhs: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub segments: [SegmentState; 6],
    /// MM/x87 register slots, 8 lanes of 80-bit-extended values stored in
    /// 128 bits each for simple addressing.
    pub mm: [[u64; 2]; 8],
    pub mxcsr: u32,
    pub x87_control: u16,
    pub x87_status: u16,
    pub x87_tag: u16,
    pub _pad: u16,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            gpr: [0; 16],
            xmm: [[0; 2]; 16],
            rip: 0,
            flags: [0; ARCH_FLAG_COUNT],
            deferred_flag_kind: 0,
            deferred_flag_width: 0,
            deferred_flag_lhs: 0,
            deferred_flag_rhs: 0,
            fs_base: 0,
            gs_base: 0,
            segments: [SegmentState::default(); 6],
            mm: [[0; 2]; 8],
            mxcsr: 0x1f80,
            x87_control: 0x037f,
            x87_status: 0,
            x87_tag: 0xffff,
            _pad: 0,
        }
    }
}

impl CpuState {
    #[must_use]
    pub fn get_flag(&self, flag: ArchFlag) -> bool {
        self.flags[flag as usize] != 0
    }

    pub fn set_flag(&mut self, flag: ArchFlag, value: bool) {
        self.flags[flag as usize] = u8::from(value);
    }

    /// Pack the byte-per-flag array into a single `RFLAGS`-shaped word,
    /// for interop with external tooling (debuggers, the §8 end-to-end
    /// test scenarios) that expects the architectural packed form. Bit 1
    /// (always set) and bit 21 (reserved 0) of real `RFLAGS` are not
    /// modeled; only the 17 tracked bits participate.
    #[must_use]
    pub fn rflags_snapshot(&self) -> u64 {
        let mut word = 0u64;
        for i in 0..ARCH_FLAG_COUNT {
            if self.flags[i] != 0 {
                word |= 1u64 << ARCH_FLAG_BIT[i];
            }
        }
        word
    }

    pub fn load_rflags(&mut self, word: u64) {
        for i in 0..ARCH_FLAG_COUNT {
            self.flags[i] = u8::from(word & (1u64 << ARCH_FLAG_BIT[i]) != 0);
        }
    }

    #[must_use]
    pub fn segment(&self, seg: crate::Segment) -> SegmentState {
        self.segments[segment_index(seg)]
    }

    pub fn set_segment(&mut self, seg: crate::Segment, state: SegmentState) {
        self.segments[segment_index(seg)] = state;
    }
}

const fn segment_index(seg: crate::Segment) -> usize {
    match seg {
        crate::Segment::Es => 0,
        crate::Segment::Cs => 1,
        crate::Segment::Ss => 2,
        crate::Segment::Ds => 3,
        crate::Segment::Fs => 4,
        crate::Segment::Gs => 5,
    }
}

/// Per-GPR byte offsets into [`CpuState`], computed once from the real
/// field layout rather than hand-maintained, so they can never drift from
/// `#[repr(C)]` reality the way a hand-copied constant table could.
pub static CPU_GPR_OFF: LazyLock<[u32; 16]> = LazyLock::new(|| {
    let base = std::mem::offset_of!(CpuState, gpr) as u32;
    std::array::from_fn(|i| base + (i as u32) * 8)
});

pub static CPU_XMM_OFF: LazyLock<[u32; 16]> = LazyLock::new(|| {
    let base = std::mem::offset_of!(CpuState, xmm) as u32;
    std::array::from_fn(|i| base + (i as u32) * 16)
});

pub static CPU_RIP_OFF: LazyLock<u32> = LazyLock::new(|| std::mem::offset_of!(CpuState, rip) as u32);
pub static CPU_RFLAGS_OFF: LazyLock<u32> =
    LazyLock::new(|| std::mem::offset_of!(CpuState, flags) as u32);
pub static CPU_STATE_SIZE: LazyLock<u32> =
    LazyLock::new(|| std::mem::size_of::<CpuState>() as u32);
pub static CPU_STATE_ALIGN: LazyLock<u32> =
    LazyLock::new(|| std::mem::align_of::<CpuState>() as u32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Segment;

    #[test]
    fn gpr_offsets_are_eight_byte_strided() {
        for i in 0..15 {
            assert_eq!(CPU_GPR_OFF[i + 1] - CPU_GPR_OFF[i], 8);
        }
    }

    #[test]
    fn xmm_offsets_are_sixteen_byte_strided() {
        for i in 0..15 {
            assert_eq!(CPU_XMM_OFF[i + 1] - CPU_XMM_OFF[i], 16);
        }
    }

    #[test]
    fn rflags_snapshot_roundtrips() {
        let mut cpu = CpuState::default();
        cpu.set_flag(ArchFlag::Cf, true);
        cpu.set_flag(ArchFlag::Zf, true);
        let word = cpu.rflags_snapshot();
        assert_eq!(word & 0b1, 1);
        assert_eq!((word >> 6) & 0b1, 1);

        let mut cpu2 = CpuState::default();
        cpu2.load_rflags(word);
        assert!(cpu2.get_flag(ArchFlag::Cf));
        assert!(cpu2.get_flag(ArchFlag::Zf));
        assert!(!cpu2.get_flag(ArchFlag::Of));
    }

    #[test]
    fn segment_round_trips() {
        let mut cpu = CpuState::default();
        cpu.set_segment(
            Segment::Fs,
            SegmentState {
                selector: 0x33,
                base: 0x7fff_0000,
            },
        );
        assert_eq!(cpu.segment(Segment::Fs).base, 0x7fff_0000);
        assert_eq!(cpu.segment(Segment::Gs).base, 0);
    }
}
