//! The architectural instruction classification produced by the opcode
//! tables (spec.md §4.2): a decoded instruction is reduced to one
//! [`InstKind`] plus its typed [`Operand`]s, which is everything
//! `dbt_frontend::lower` needs to avoid re-inspecting raw decoder state.

use crate::operand::Operand;
use dbt_types::{Cond, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOp {
    Rol,
    Ror,
    /// Rotate-through-carry (RCL/RCR), whose cascade construction (spec.md
    /// §4.3) differs from a plain rotate.
    Rcl,
    Rcr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Bt,
    Bts,
    Btr,
    Btc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    None,
    Rep,
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWriteOp {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// PC-relative branch; `offset` is relative to the address *after*
    /// this instruction.
    Relative(i64),
    Indirect(Operand),
}

/// Which opcode-map family an unclassified mnemonic came from. Lets
/// `Unsupported` distinguish "ordinary GPR opcode nobody lowered yet"
/// from the two escape tables whose entire instruction set is out of
/// scope (spec.md's vector/FP taxonomy Non-goal): x87 (`D8`-`DF`) and
/// the `0F 0F` 3DNow! immediate-opcode escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Primary/secondary/group/VEX opcode-map mnemonic with no lowering.
    Generic,
    /// `0F 0F /r ib` 3DNow! escape (e.g. `PFADD`, `PFMUL`, `FEMMS`).
    ThreeDNow,
    /// x87 floating-point stack opcode (`D8`-`DF`).
    X87,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Opcode byte(s) do not form any known instruction (decode error) —
    /// the front end lowers this to `Break(SIGILL)` (spec.md §4.2, §4.3).
    Invalid,
    /// A known mnemonic this crate has not implemented semantic lowering
    /// for; the front end lowers this to `UnimplementedOp` (spec.md §4.3).
    Unsupported { mnemonic: String, table: TableKind },
    Nop,
    Mov { dst: Operand, src: Operand },
    Lea { dst: Operand, addr: Operand },
    Alu { op: AluOp, dst: Operand, src: Operand },
    Not { dst: Operand },
    Neg { dst: Operand },
    Shift { op: ShiftOp, dst: Operand, count: Operand },
    /// SHLD/SHRD: funnel shift of `dst` filled in from `src`.
    DoubleShift {
        op: ShiftOp,
        dst: Operand,
        src: Operand,
        count: Operand,
    },
    Rotate { op: RotateOp, dst: Operand, count: Operand },
    /// One-operand MUL/IMUL (`AX <- AL*src`, `EDX:EAX <- EAX*src`, ...).
    Mul { signed: bool, src: Operand },
    /// Two/three-operand IMUL (`dst <- dst*src` or `dst <- src*imm`).
    ImulWide {
        dst: Operand,
        src: Operand,
        imm: Option<Operand>,
    },
    Div { signed: bool, src: Operand },
    Push { src: Operand },
    Pop { dst: Operand },
    Jmp { target: JumpTarget },
    Jcc { cond: Cond, target: JumpTarget },
    SetCc { cond: Cond, dst: Operand },
    CmovCc { cond: Cond, dst: Operand, src: Operand },
    Call { target: JumpTarget },
    Ret,
    BitTest {
        op: BitOp,
        dst: Operand,
        bit: Operand,
        lock: bool,
    },
    Xadd { dst: Operand, src: Operand, lock: bool },
    Xchg { a: Operand, b: Operand },
    Cmpxchg { dst: Operand, src: Operand, lock: bool },
    StringOp {
        op: StringOp,
        rep: RepPrefix,
        width: Width,
    },
    Cpuid,
    Rdtsc,
    /// `Syscall(arg0..arg6, flags)` per spec.md §6; arguments are read from
    /// the ABI-defined registers by the front end, not carried here.
    Syscall,
    Int { vector: u8 },
    Halt,
    ExplicitFlagWrite { op: FlagWriteOp },
    Ud2,
}

impl InstKind {
    /// Whether this is one of the instructions the decoder treats as a
    /// block terminator (spec.md §4.2: "any branch, call, return,
    /// interrupt, halt or syscall").
    #[must_use]
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            InstKind::Jmp { .. }
                | InstKind::Jcc { .. }
                | InstKind::Call { .. }
                | InstKind::Ret
                | InstKind::Syscall
                | InstKind::Int { .. }
                | InstKind::Halt
                | InstKind::Ud2
                | InstKind::Invalid
        )
    }
}
