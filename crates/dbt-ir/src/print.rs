//! Deterministic textual serialization (spec.md §4.1 `print`) and its
//! inverse, used by the validator's error messages and by the §8
//! round-trip property (`print(ir) . parse = identity`).

use crate::block::Block;
use crate::function::Function;
use crate::op::{
    AtomicOp, BinOp, BreakReason, DeferredFlagKind, DivPart, Instr, MemOrder, MulPart, RotateKind,
    ShiftKind, Terminator, UnOp,
};
use crate::value::{BlockId, Operand, ValueId};
use dbt_types::{ArchFlag, Cond, Gpr, Width};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("IR parse error: {0}")]
pub struct ParseError(pub String);

fn perr(msg: impl Into<String>) -> ParseError {
    ParseError(msg.into())
}

fn width_tok(w: Width) -> &'static str {
    match w {
        Width::W8 => "w8",
        Width::W16 => "w16",
        Width::W32 => "w32",
        Width::W64 => "w64",
    }
}

fn parse_width(s: &str) -> Result<Width, ParseError> {
    Ok(match s {
        "w8" => Width::W8,
        "w16" => Width::W16,
        "w32" => Width::W32,
        "w64" => Width::W64,
        other => return Err(perr(format!("bad width {other}"))),
    })
}

fn gpr_tok(g: Gpr) -> &'static str {
    match g {
        Gpr::Rax => "rax",
        Gpr::Rcx => "rcx",
        Gpr::Rdx => "rdx",
        Gpr::Rbx => "rbx",
        Gpr::Rsp => "rsp",
        Gpr::Rbp => "rbp",
        Gpr::Rsi => "rsi",
        Gpr::Rdi => "rdi",
        Gpr::R8 => "r8",
        Gpr::R9 => "r9",
        Gpr::R10 => "r10",
        Gpr::R11 => "r11",
        Gpr::R12 => "r12",
        Gpr::R13 => "r13",
        Gpr::R14 => "r14",
        Gpr::R15 => "r15",
    }
}

fn parse_gpr(s: &str) -> Result<Gpr, ParseError> {
    Ok(match s {
        "rax" => Gpr::Rax,
        "rcx" => Gpr::Rcx,
        "rdx" => Gpr::Rdx,
        "rbx" => Gpr::Rbx,
        "rsp" => Gpr::Rsp,
        "rbp" => Gpr::Rbp,
        "rsi" => Gpr::Rsi,
        "rdi" => Gpr::Rdi,
        "r8" => Gpr::R8,
        "r9" => Gpr::R9,
        "r10" => Gpr::R10,
        "r11" => Gpr::R11,
        "r12" => Gpr::R12,
        "r13" => Gpr::R13,
        "r14" => Gpr::R14,
        "r15" => Gpr::R15,
        other => return Err(perr(format!("bad gpr {other}"))),
    })
}

fn flag_tok(f: ArchFlag) -> &'static str {
    match f {
        ArchFlag::Cf => "cf",
        ArchFlag::Pf => "pf",
        ArchFlag::Af => "af",
        ArchFlag::Zf => "zf",
        ArchFlag::Sf => "sf",
        ArchFlag::Tf => "tf",
        ArchFlag::If => "if",
        ArchFlag::Df => "df",
        ArchFlag::Of => "of",
        ArchFlag::Iopl0 => "iopl0",
        ArchFlag::Iopl1 => "iopl1",
        ArchFlag::Nt => "nt",
        ArchFlag::Rf => "rf",
        ArchFlag::Reserved1 => "r1",
        ArchFlag::Reserved3 => "r3",
        ArchFlag::Reserved5 => "r5",
        ArchFlag::Reserved15 => "r15resv",
    }
}

fn parse_flag(s: &str) -> Result<ArchFlag, ParseError> {
    Ok(match s {
        "cf" => ArchFlag::Cf,
        "pf" => ArchFlag::Pf,
        "af" => ArchFlag::Af,
        "zf" => ArchFlag::Zf,
        "sf" => ArchFlag::Sf,
        "tf" => ArchFlag::Tf,
        "if" => ArchFlag::If,
        "df" => ArchFlag::Df,
        "of" => ArchFlag::Of,
        "iopl0" => ArchFlag::Iopl0,
        "iopl1" => ArchFlag::Iopl1,
        "nt" => ArchFlag::Nt,
        "rf" => ArchFlag::Rf,
        "r1" => ArchFlag::Reserved1,
        "r3" => ArchFlag::Reserved3,
        "r5" => ArchFlag::Reserved5,
        "r15resv" => ArchFlag::Reserved15,
        other => return Err(perr(format!("bad flag {other}"))),
    })
}

fn cond_tok(c: Cond) -> &'static str {
    match c {
        Cond::O => "o",
        Cond::No => "no",
        Cond::B => "b",
        Cond::Ae => "ae",
        Cond::E => "e",
        Cond::Ne => "ne",
        Cond::Be => "be",
        Cond::A => "a",
        Cond::S => "s",
        Cond::Ns => "ns",
        Cond::P => "p",
        Cond::Np => "np",
        Cond::L => "l",
        Cond::Ge => "ge",
        Cond::Le => "le",
        Cond::G => "g",
    }
}

fn parse_cond(s: &str) -> Result<Cond, ParseError> {
    Ok(match s {
        "o" => Cond::O,
        "no" => Cond::No,
        "b" => Cond::B,
        "ae" => Cond::Ae,
        "e" => Cond::E,
        "ne" => Cond::Ne,
        "be" => Cond::Be,
        "a" => Cond::A,
        "s" => Cond::S,
        "ns" => Cond::Ns,
        "p" => Cond::P,
        "np" => Cond::Np,
        "l" => Cond::L,
        "ge" => Cond::Ge,
        "le" => Cond::Le,
        "g" => Cond::G,
        other => return Err(perr(format!("bad cond {other}"))),
    })
}

fn binop_tok(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::Shr => "shr",
        BinOp::Sar => "sar",
        BinOp::Eq => "eq",
        BinOp::Ne => "ne",
        BinOp::LtU => "ltu",
        BinOp::LeU => "leu",
        BinOp::LtS => "lts",
        BinOp::LeS => "les",
    }
}

fn parse_binop(s: &str) -> Result<BinOp, ParseError> {
    Ok(match s {
        "add" => BinOp::Add,
        "sub" => BinOp::Sub,
        "mul" => BinOp::Mul,
        "and" => BinOp::And,
        "or" => BinOp::Or,
        "xor" => BinOp::Xor,
        "shl" => BinOp::Shl,
        "shr" => BinOp::Shr,
        "sar" => BinOp::Sar,
        "eq" => BinOp::Eq,
        "ne" => BinOp::Ne,
        "ltu" => BinOp::LtU,
        "leu" => BinOp::LeU,
        "lts" => BinOp::LtS,
        "les" => BinOp::LeS,
        other => return Err(perr(format!("bad binop {other}"))),
    })
}

fn unop_tok(op: UnOp) -> &'static str {
    match op {
        UnOp::Not => "not",
        UnOp::Neg => "neg",
        UnOp::Popcount => "popcount",
        UnOp::Lzcnt => "lzcnt",
        UnOp::Tzcnt => "tzcnt",
        UnOp::Rev => "rev",
    }
}

fn parse_unop(s: &str) -> Result<UnOp, ParseError> {
    Ok(match s {
        "not" => UnOp::Not,
        "neg" => UnOp::Neg,
        "popcount" => UnOp::Popcount,
        "lzcnt" => UnOp::Lzcnt,
        "tzcnt" => UnOp::Tzcnt,
        "rev" => UnOp::Rev,
        other => return Err(perr(format!("bad unop {other}"))),
    })
}

fn shift_tok(op: ShiftKind) -> &'static str {
    match op {
        ShiftKind::Shl => "shl",
        ShiftKind::Shr => "shr",
        ShiftKind::Sar => "sar",
    }
}

fn parse_shift(s: &str) -> Result<ShiftKind, ParseError> {
    Ok(match s {
        "shl" => ShiftKind::Shl,
        "shr" => ShiftKind::Shr,
        "sar" => ShiftKind::Sar,
        other => return Err(perr(format!("bad shift op {other}"))),
    })
}

fn rotate_tok(op: RotateKind) -> &'static str {
    match op {
        RotateKind::Rol => "rol",
        RotateKind::Ror => "ror",
    }
}

fn parse_rotate(s: &str) -> Result<RotateKind, ParseError> {
    Ok(match s {
        "rol" => RotateKind::Rol,
        "ror" => RotateKind::Ror,
        other => return Err(perr(format!("bad rotate op {other}"))),
    })
}

fn order_tok(o: MemOrder) -> &'static str {
    match o {
        MemOrder::Tso => "tso",
        MemOrder::NonTso => "nontso",
    }
}

fn parse_order(s: &str) -> Result<MemOrder, ParseError> {
    Ok(match s {
        "tso" => MemOrder::Tso,
        "nontso" => MemOrder::NonTso,
        other => return Err(perr(format!("bad mem order {other}"))),
    })
}

fn atomic_tok(op: AtomicOp) -> &'static str {
    match op {
        AtomicOp::Add => "add",
        AtomicOp::And => "and",
        AtomicOp::Or => "or",
        AtomicOp::Xor => "xor",
        AtomicOp::Xchg => "xchg",
    }
}

fn parse_atomic(s: &str) -> Result<AtomicOp, ParseError> {
    Ok(match s {
        "add" => AtomicOp::Add,
        "and" => AtomicOp::And,
        "or" => AtomicOp::Or,
        "xor" => AtomicOp::Xor,
        "xchg" => AtomicOp::Xchg,
        other => return Err(perr(format!("bad atomic op {other}"))),
    })
}

fn deferred_kind_tok(k: DeferredFlagKind) -> &'static str {
    match k {
        DeferredFlagKind::Add => "add",
        DeferredFlagKind::Sub => "sub",
        DeferredFlagKind::Cmp => "cmp",
        DeferredFlagKind::And => "and",
        DeferredFlagKind::Or => "or",
        DeferredFlagKind::Xor => "xor",
        DeferredFlagKind::Test => "test",
        DeferredFlagKind::Inc => "inc",
        DeferredFlagKind::Dec => "dec",
        DeferredFlagKind::Shl => "shl",
        DeferredFlagKind::Shr => "shr",
        DeferredFlagKind::Sar => "sar",
        DeferredFlagKind::Rotate => "rotate",
        DeferredFlagKind::Mul => "mul",
    }
}

fn parse_deferred_kind(s: &str) -> Result<DeferredFlagKind, ParseError> {
    Ok(match s {
        "add" => DeferredFlagKind::Add,
        "sub" => DeferredFlagKind::Sub,
        "cmp" => DeferredFlagKind::Cmp,
        "and" => DeferredFlagKind::And,
        "or" => DeferredFlagKind::Or,
        "xor" => DeferredFlagKind::Xor,
        "test" => DeferredFlagKind::Test,
        "inc" => DeferredFlagKind::Inc,
        "dec" => DeferredFlagKind::Dec,
        "shl" => DeferredFlagKind::Shl,
        "shr" => DeferredFlagKind::Shr,
        "sar" => DeferredFlagKind::Sar,
        "rotate" => DeferredFlagKind::Rotate,
        "mul" => DeferredFlagKind::Mul,
        other => return Err(perr(format!("bad deferred-flag kind {other}"))),
    })
}

fn break_reason_tok(r: BreakReason) -> &'static str {
    match r {
        BreakReason::Sigill => "sigill",
        BreakReason::Sigsegv => "sigsegv",
        BreakReason::Sigtrap => "sigtrap",
        BreakReason::Sigfpe => "sigfpe",
    }
}

fn parse_break_reason(s: &str) -> Result<BreakReason, ParseError> {
    Ok(match s {
        "sigill" => BreakReason::Sigill,
        "sigsegv" => BreakReason::Sigsegv,
        "sigtrap" => BreakReason::Sigtrap,
        "sigfpe" => BreakReason::Sigfpe,
        other => return Err(perr(format!("bad break reason {other}"))),
    })
}

fn tok(s: &str) -> Result<Operand, ParseError> {
    s.trim().parse()
}

fn bool_tok(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}

fn parse_bool(s: &str) -> Result<bool, ParseError> {
    match s {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(perr(format!("bad bool {other}"))),
    }
}

fn write_instr(out: &mut String, instr: &Instr) {
    match instr {
        Instr::Nop => {
            writeln!(out, "nop").unwrap();
        }
        Instr::Const { dst, value } => {
            writeln!(out, "{dst} = const {value:#x}").unwrap();
        }
        Instr::LoadReg { dst, reg, width } => {
            writeln!(out, "{dst} = load_reg {}:{}", gpr_tok(*reg), width_tok(*width)).unwrap();
        }
        Instr::StoreReg { reg, src, width } => {
            writeln!(out, "store_reg {}, {src}:{}", gpr_tok(*reg), width_tok(*width)).unwrap();
        }
        Instr::LoadFlag { dst, flag } => {
            writeln!(out, "{dst} = load_flag {}", flag_tok(*flag)).unwrap();
        }
        Instr::StoreFlagBit { flag, value } => {
            writeln!(out, "store_flag {}, {value}", flag_tok(*flag)).unwrap();
        }
        Instr::Addr { dst, base, index, disp } => {
            let base_s = base.map_or("none".to_string(), |b| b.to_string());
            let index_s = index.map_or("none,0".to_string(), |(v, s)| format!("{v},{s}"));
            writeln!(out, "{dst} = addr {base_s}, {index_s}, {disp:#x}").unwrap();
        }
        Instr::LoadMem { dst, addr, width, order } => {
            writeln!(out, "{dst} = load_mem {addr}:{}, {}", width_tok(*width), order_tok(*order)).unwrap();
        }
        Instr::StoreMem { addr, src, width, order } => {
            writeln!(out, "store_mem {addr}, {src}:{}, {}", width_tok(*width), order_tok(*order)).unwrap();
        }
        Instr::BinOp { dst, op, lhs, rhs } => {
            writeln!(out, "{dst} = binop {} {lhs}, {rhs}", binop_tok(*op)).unwrap();
        }
        Instr::UnOp { dst, op, src, width } => {
            writeln!(out, "{dst} = unop {} {src}:{}", unop_tok(*op), width_tok(*width)).unwrap();
        }
        Instr::Shift { dst, op, value, count, width } => {
            writeln!(out, "{dst} = shift {} {value}, {count}:{}", shift_tok(*op), width_tok(*width)).unwrap();
        }
        Instr::Rotate { dst, op, value, count, width } => {
            writeln!(out, "{dst} = rotate {} {value}, {count}:{}", rotate_tok(*op), width_tok(*width)).unwrap();
        }
        Instr::Bfi { dst, base, insert, lsb, width } => {
            writeln!(out, "{dst} = bfi {base}, {insert}, {lsb}, {width}").unwrap();
        }
        Instr::Bfe { dst, src, lsb, width, signed } => {
            writeln!(out, "{dst} = bfe {src}, {lsb}, {width}, {}", bool_tok(*signed)).unwrap();
        }
        Instr::Mul { dst, lhs, rhs, width, signed, part } => {
            let part = match part {
                MulPart::Low => "lo",
                MulPart::High => "hi",
            };
            writeln!(out, "{dst} = mul {lhs}, {rhs}:{}, {}, {part}", width_tok(*width), bool_tok(*signed)).unwrap();
        }
        Instr::Div { dst, lo, hi, divisor, width, signed, part } => {
            let part = match part {
                DivPart::Quotient => "q",
                DivPart::Remainder => "r",
            };
            writeln!(out, "{dst} = div {lo}, {hi}, {divisor}:{}, {}, {part}", width_tok(*width), bool_tok(*signed))
                .unwrap();
        }
        Instr::CondSelect { dst, cond, if_true, if_false } => {
            writeln!(out, "{dst} = condselect {} {if_true}, {if_false}", cond_tok(*cond)).unwrap();
        }
        Instr::Select { dst, cond, if_true, if_false } => {
            writeln!(out, "{dst} = select {cond}, {if_true}, {if_false}").unwrap();
        }
        Instr::SetDeferredFlags { kind, width, lhs, rhs } => {
            writeln!(out, "set_deferred_flags {} {lhs}, {rhs}:{}", deferred_kind_tok(*kind), width_tok(*width))
                .unwrap();
        }
        Instr::MaterializeFlags => {
            writeln!(out, "materialize_flags").unwrap();
        }
        Instr::InvalidateDeferredFlags => {
            writeln!(out, "invalidate_deferred_flags").unwrap();
        }
        Instr::AtomicFetchOp { dst, addr, op, src, width } => {
            writeln!(out, "{dst} = atomic_fetch {} {addr}, {src}:{}", atomic_tok(*op), width_tok(*width)).unwrap();
        }
        Instr::AtomicCas { dst, addr, expected, new, width } => {
            writeln!(out, "{dst} = atomic_cas {addr}, {expected}, {new}:{}", width_tok(*width)).unwrap();
        }
        Instr::Fence => {
            writeln!(out, "fence").unwrap();
        }
        Instr::MemCpy { dst_addr, src_addr, count, width, backward } => {
            writeln!(out, "memcpy {dst_addr}, {src_addr}, {count}:{}, {}", width_tok(*width), bool_tok(*backward))
                .unwrap();
        }
        Instr::MemSet { addr, value, count, width, backward } => {
            writeln!(out, "memset {addr}, {value}, {count}:{}, {}", width_tok(*width), bool_tok(*backward)).unwrap();
        }
        Instr::Cpuid { dst_eax, dst_ebx, dst_ecx, dst_edx, leaf } => {
            writeln!(out, "{dst_eax}, {dst_ebx}, {dst_ecx}, {dst_edx} = cpuid {leaf}").unwrap();
        }
        Instr::Rdtsc { dst } => {
            writeln!(out, "{dst} = rdtsc").unwrap();
        }
        Instr::Syscall { dst, number, args } => {
            writeln!(
                out,
                "{dst} = syscall {number}, {}, {}, {}, {}, {}, {}",
                args[0], args[1], args[2], args[3], args[4], args[5]
            )
            .unwrap();
        }
        Instr::FastSyscall { dst, number, args } => {
            writeln!(
                out,
                "{dst} = fast_syscall #{number:#x}, {}, {}, {}, {}, {}, {}",
                args[0], args[1], args[2], args[3], args[4], args[5]
            )
            .unwrap();
        }
    }
}

fn write_terminator(out: &mut String, term: &Terminator) {
    match term {
        Terminator::Jump { target } => {
            writeln!(out, "jump {target}").unwrap();
        }
        Terminator::CondJump { cond, if_true, if_false } => {
            writeln!(out, "condjump {} {if_true}, {if_false}", cond_tok(*cond)).unwrap();
        }
        Terminator::BranchIf { cond, if_true, if_false } => {
            writeln!(out, "branchif {cond}, {if_true}, {if_false}").unwrap();
        }
        Terminator::ExitFunction { rip } => {
            writeln!(out, "exit {rip}").unwrap();
        }
        Terminator::Break { reason, trap_number, si_code, error_register } => {
            writeln!(
                out,
                "break {}, {trap_number:#x}, {si_code:#x}, {error_register:#x}",
                break_reason_tok(*reason)
            )
            .unwrap();
        }
    }
}

/// Deterministic textual form of `f` (spec.md §4.1 `print`). Each block is
/// a labeled region of one-instruction-per-line bodies followed by its
/// terminator.
#[must_use]
pub fn print(f: &Function) -> String {
    let mut out = String::new();
    writeln!(out, "function entry_rip={:#x} guest_inst_count={}", f.entry_rip, f.guest_inst_count).unwrap();
    for block in &f.blocks {
        writeln!(out, "{}:", block.id).unwrap();
        for instr in block.iter() {
            out.push_str("  ");
            write_instr(&mut out, instr);
        }
        if let Some(term) = &block.terminator {
            out.push_str("  ");
            write_terminator(&mut out, term);
        }
    }
    out
}

fn split2(rest: &str) -> Result<(&str, &str), ParseError> {
    let mut parts = rest.trim().splitn(2, char::is_whitespace);
    let op = parts.next().ok_or_else(|| perr("empty instruction"))?;
    let args = parts.next().unwrap_or("").trim();
    Ok((op, args))
}

fn csv(args: &str) -> Vec<&str> {
    if args.is_empty() {
        return vec![];
    }
    args.split(',').map(str::trim).collect()
}

fn split_width(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once(':') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    }
}

/// Parses a non-defining (side-effect-only) instruction line. Defining
/// lines (`vN = ...`) are handled by [`parse_defining_line`]; `parse`
/// dispatches between the two based on whether the line contains `" = "`.
fn parse_instr_line(line: &str) -> Result<Instr, ParseError> {
    let line = line.trim();
    let (op, args) = split2(line)?;
    let a = csv(args);
    match op {
        "nop" => Ok(Instr::Nop),
        "store_reg" => {
            let (src, w) = split_width(a[1]);
            Ok(Instr::StoreReg { reg: parse_gpr(a[0])?, src: tok(src)?, width: parse_width(w.ok_or_else(|| perr("width"))?)? })
        }
        "store_flag" => Ok(Instr::StoreFlagBit { flag: parse_flag(a[0])?, value: tok(a[1])? }),
        "store_mem" => {
            let (src, w) = split_width(a[1]);
            Ok(Instr::StoreMem {
                addr: tok(a[0])?,
                src: tok(src)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                order: parse_order(a[2])?,
            })
        }
        "set_deferred_flags" => {
            let (kind, lhs) = split2(args)?;
            let a2 = csv(lhs);
            let (rhs, w) = split_width(a2[1]);
            Ok(Instr::SetDeferredFlags {
                kind: parse_deferred_kind(kind)?,
                lhs: tok(a2[0])?,
                rhs: tok(rhs)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
            })
        }
        "materialize_flags" => Ok(Instr::MaterializeFlags),
        "invalidate_deferred_flags" => Ok(Instr::InvalidateDeferredFlags),
        "fence" => Ok(Instr::Fence),
        "memcpy" => {
            let (count, w) = split_width(a[2]);
            Ok(Instr::MemCpy {
                dst_addr: tok(a[0])?,
                src_addr: tok(a[1])?,
                count: tok(count)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                backward: parse_bool(a[3])?,
            })
        }
        "memset" => {
            let (count, w) = split_width(a[2]);
            Ok(Instr::MemSet {
                addr: tok(a[0])?,
                value: tok(a[1])?,
                count: tok(count)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                backward: parse_bool(a[3])?,
            })
        }
        other => Err(perr(format!("unknown op {other}"))),
    }
}

fn parse_defining_line(line: &str) -> Result<Instr, ParseError> {
    let (lhs, rhs) = line.split_once(" = ").ok_or_else(|| perr("expected '='"))?;
    let dsts: Vec<ValueId> = lhs.split(',').map(|t| t.trim().parse()).collect::<Result<_, _>>()?;
    let (op, args) = split2(rhs)?;
    let a = csv(args);
    let dst = dsts[0];
    Ok(match op {
        "const" => {
            let v = a[0].trim_start_matches("0x");
            Instr::Const { dst, value: u64::from_str_radix(v, 16).map_err(|_| perr("const"))? }
        }
        "load_reg" => {
            let (r, w) = split_width(a[0]);
            Instr::LoadReg { dst, reg: parse_gpr(r)?, width: parse_width(w.ok_or_else(|| perr("width"))?)? }
        }
        "load_flag" => Instr::LoadFlag { dst, flag: parse_flag(a[0])? },
        "addr" => {
            let base = if a[0] == "none" { None } else { Some(tok(a[0])?) };
            let index = if a[1] == "none" { None } else { Some((tok(a[1])?, a[2].parse().map_err(|_| perr("scale"))?)) };
            let disp_s = a[3].trim_start_matches("0x");
            let disp = i64::from_str_radix(disp_s, 16).map_err(|_| perr("disp"))?;
            Instr::Addr { dst, base, index, disp }
        }
        "load_mem" => {
            let (addr, w) = split_width(a[0]);
            Instr::LoadMem {
                dst,
                addr: tok(addr)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                order: parse_order(a[1])?,
            }
        }
        "binop" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            Instr::BinOp { dst, op: parse_binop(name)?, lhs: tok(ra[0])?, rhs: tok(ra[1])? }
        }
        "unop" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            let (src, w) = split_width(ra[0]);
            Instr::UnOp { dst, op: parse_unop(name)?, src: tok(src)?, width: parse_width(w.ok_or_else(|| perr("width"))?)? }
        }
        "shift" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            let (count, w) = split_width(ra[1]);
            Instr::Shift {
                dst,
                op: parse_shift(name)?,
                value: tok(ra[0])?,
                count: tok(count)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
            }
        }
        "rotate" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            let (count, w) = split_width(ra[1]);
            Instr::Rotate {
                dst,
                op: parse_rotate(name)?,
                value: tok(ra[0])?,
                count: tok(count)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
            }
        }
        "bfi" => Instr::Bfi {
            dst,
            base: tok(a[0])?,
            insert: tok(a[1])?,
            lsb: a[2].parse().map_err(|_| perr("lsb"))?,
            width: a[3].parse().map_err(|_| perr("width"))?,
        },
        "bfe" => Instr::Bfe {
            dst,
            src: tok(a[0])?,
            lsb: a[1].parse().map_err(|_| perr("lsb"))?,
            width: a[2].parse().map_err(|_| perr("width"))?,
            signed: parse_bool(a[3])?,
        },
        "mul" => {
            let (rhs_w, w) = split_width(a[1]);
            Instr::Mul {
                dst,
                lhs: tok(a[0])?,
                rhs: tok(rhs_w)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                signed: parse_bool(a[2])?,
                part: if a[3] == "lo" { MulPart::Low } else { MulPart::High },
            }
        }
        "div" => {
            let (divisor, w) = split_width(a[2]);
            Instr::Div {
                dst,
                lo: tok(a[0])?,
                hi: tok(a[1])?,
                divisor: tok(divisor)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
                signed: parse_bool(a[3])?,
                part: if a[4] == "q" { DivPart::Quotient } else { DivPart::Remainder },
            }
        }
        "condselect" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            Instr::CondSelect { dst, cond: parse_cond(name)?, if_true: tok(ra[0])?, if_false: tok(ra[1])? }
        }
        "select" => Instr::Select { dst, cond: tok(a[0])?, if_true: tok(a[1])?, if_false: tok(a[2])? },
        "atomic_fetch" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            let (src, w) = split_width(ra[1]);
            Instr::AtomicFetchOp {
                dst,
                op: parse_atomic(name)?,
                addr: tok(ra[0])?,
                src: tok(src)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
            }
        }
        "atomic_cas" => {
            let (new, w) = split_width(a[2]);
            Instr::AtomicCas {
                dst,
                addr: tok(a[0])?,
                expected: tok(a[1])?,
                new: tok(new)?,
                width: parse_width(w.ok_or_else(|| perr("width"))?)?,
            }
        }
        "cpuid" => {
            return Ok(Instr::Cpuid {
                dst_eax: dsts[0],
                dst_ebx: dsts[1],
                dst_ecx: dsts[2],
                dst_edx: dsts[3],
                leaf: tok(a[0])?,
            });
        }
        "rdtsc" => Instr::Rdtsc { dst },
        "syscall" => Instr::Syscall {
            dst,
            number: tok(a[0])?,
            args: [tok(a[1])?, tok(a[2])?, tok(a[3])?, tok(a[4])?, tok(a[5])?, tok(a[6])?],
        },
        "fast_syscall" => {
            let number_str = a[0]
                .strip_prefix("#0x")
                .ok_or_else(|| perr(format!("bad fast_syscall number {}", a[0])))?;
            Instr::FastSyscall {
                dst,
                number: u64::from_str_radix(number_str, 16).map_err(|_| perr(format!("bad fast_syscall number {}", a[0])))?,
                args: [tok(a[1])?, tok(a[2])?, tok(a[3])?, tok(a[4])?, tok(a[5])?, tok(a[6])?],
            }
        }
        other => return Err(perr(format!("unknown defining op {other}"))),
    })
}

fn parse_terminator_line(line: &str) -> Result<Terminator, ParseError> {
    let (op, args) = split2(line)?;
    let a = csv(args);
    Ok(match op {
        "jump" => Terminator::Jump { target: a[0].parse()? },
        "condjump" => {
            let (name, rest) = split2(args)?;
            let ra = csv(rest);
            Terminator::CondJump { cond: parse_cond(name)?, if_true: ra[0].parse()?, if_false: ra[1].parse()? }
        }
        "branchif" => Terminator::BranchIf { cond: tok(a[0])?, if_true: a[1].parse()?, if_false: a[2].parse()? },
        "exit" => Terminator::ExitFunction { rip: tok(a[0])? },
        "break" => {
            let trap = a[1].trim_start_matches("0x");
            let si = a[2].trim_start_matches("0x");
            let err = a[3].trim_start_matches("0x");
            Terminator::Break {
                reason: parse_break_reason(a[0])?,
                trap_number: u32::from_str_radix(trap, 16).map_err(|_| perr("trap_number"))?,
                si_code: i32::from_str_radix(si, 16).map_err(|_| perr("si_code"))?,
                error_register: u64::from_str_radix(err, 16).map_err(|_| perr("error_register"))?,
            }
        }
        other => return Err(perr(format!("unknown terminator {other}"))),
    })
}

fn is_terminator_keyword(op: &str) -> bool {
    matches!(op, "jump" | "condjump" | "branchif" | "exit" | "break")
}

/// Inverse of [`print`]. Reconstructs a [`Function`] whose blocks are all
/// `Sealed` (every parsed terminator seals its block directly).
pub fn parse(text: &str) -> Result<Function, ParseError> {
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| perr("empty input"))?;
    let header = header.strip_prefix("function entry_rip=").ok_or_else(|| perr("missing header"))?;
    let (rip_s, count_s) = header.split_once(" guest_inst_count=").ok_or_else(|| perr("bad header"))?;
    let rip = u64::from_str_radix(rip_s.trim_start_matches("0x"), 16).map_err(|_| perr("bad entry_rip"))?;
    let guest_inst_count: u32 = count_s.trim().parse().map_err(|_| perr("bad guest_inst_count"))?;

    let mut function = Function::new(rip);
    function.guest_inst_count = guest_inst_count;
    function.blocks.clear();

    let mut current: Option<Block> = None;
    for raw_line in lines {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            if let Some(b) = current.take() {
                function.blocks.push(b);
            }
            let id: BlockId = label.parse()?;
            current = Some(Block::new(id));
            continue;
        }
        let block = current.as_mut().ok_or_else(|| perr("instruction before any block label"))?;
        let first_word = line.split_whitespace().next().unwrap_or("");
        if is_terminator_keyword(first_word) {
            block.terminator = Some(parse_terminator_line(line)?);
            block.state = crate::block::BlockState::Sealed;
        } else if line.contains(" = ") {
            block.instrs.push(parse_defining_line(line)?);
        } else {
            block.instrs.push(parse_instr_line(line)?);
        }
    }
    if let Some(b) = current.take() {
        function.blocks.push(b);
    }
    if function.blocks.is_empty() {
        return Err(perr("no blocks parsed"));
    }
    function.entry_block = function.blocks[0].id;
    function.state = crate::function::FunctionState::Finalized;
    Ok(function)
}
