//! Syscall optimization (spec.md §4.4 step 4): replaces `Instr::Syscall`
//! with `Instr::FastSyscall` whenever the syscall number is a compile-time
//! constant drawn from a known-safe allowlist — pure register in/out
//! syscalls that never touch guest memory and never block, so the backend
//! does not need to spill the full register file around the call the way
//! the generic path requires.
//!
//! The allowlist is the Linux x86-64 syscall numbers for `getpid`,
//! `gettid`, `getppid`, `getuid`, `geteuid`, `getgid`, `getegid` and
//! `sched_yield`.

use dbt_ir::{Function, Instr, Operand};

const SAFE_SYSCALL_NUMBERS: &[u64] = &[
    39,  // getpid
    186, // gettid
    110, // getppid
    102, // getuid
    107, // geteuid
    104, // getgid
    108, // getegid
    24,  // sched_yield
];

fn is_safe(number: u64) -> bool {
    SAFE_SYSCALL_NUMBERS.contains(&number)
}

pub fn optimize_syscalls(f: &mut Function) -> bool {
    let mut changed = false;
    for block in &mut f.blocks {
        for instr in &mut block.instrs {
            if let Instr::Syscall { dst, number, args } = instr {
                if let Operand::Const(n) = number {
                    if is_safe(*n) {
                        *instr = Instr::FastSyscall { dst: *dst, number: *n, args: *args };
                        changed = true;
                    }
                }
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbt_ir::{print, validate, IrBuilder, Terminator};
    use dbt_types::Width;

    #[test]
    fn known_safe_number_is_specialized() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let ret = b.emit_syscall(Operand::Const(39), [Operand::Const(0); 6]);
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(ret), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(optimize_syscalls(&mut f));
        let text = print(&f);
        assert!(text.contains("fast_syscall #0x27"), "unexpected IR:\n{text}");
        validate(&f).unwrap();
    }

    #[test]
    fn unknown_number_is_left_generic() {
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let rax = b.emit_load_reg(dbt_types::Gpr::Rax, Width::W64);
        let ret = b.emit_syscall(Operand::Value(rax), [Operand::Const(0); 6]);
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(ret), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();

        assert!(!optimize_syscalls(&mut f));
    }

    #[test]
    fn dynamic_number_equal_to_a_safe_constant_is_not_specialized() {
        // A syscall number that happens to be a register-held value equal
        // to a safe constant must NOT be specialized: only a
        // compile-time-visible `Operand::Const` qualifies, since this pass
        // runs before constant propagation has necessarily proven the
        // register always holds that value at every call site.
        let mut b = IrBuilder::new(0x1000);
        let entry = b.current_block();
        let number = b.emit_load_reg(dbt_types::Gpr::Rax, Width::W64);
        let ret = b.emit_syscall(Operand::Value(number), [Operand::Const(0); 6]);
        b.emit_store_reg(dbt_types::Gpr::Rax, Operand::Value(ret), Width::W64);
        b.terminate(entry, Terminator::ExitFunction { rip: Operand::Const(0) }).unwrap();
        let mut f = b.finish();
        assert!(!optimize_syscalls(&mut f));
    }
}
