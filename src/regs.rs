//! x86_64 registers the supervisor needs to name.

use std::fmt;

use libc::user_regs_struct;

/// A register of the x86_64 syscall calling convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reg {
    Rdi,
    Rsi,
    Rdx,
    R10,
    R8,
    R9,
    Rsp,
    OrigRax,
}

impl Reg {
    /// Syscall argument registers in calling-convention order.
    pub(crate) const ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];

    /// Zero-based syscall argument position, if this is an argument register.
    pub(crate) fn arg_position(self) -> Option<usize> {
        Reg::ARGS.iter().position(|&reg| reg == self)
    }

    pub(crate) fn get(self, regs: &user_regs_struct) -> u64 {
        match self {
            Reg::Rdi => regs.rdi,
            Reg::Rsi => regs.rsi,
            Reg::Rdx => regs.rdx,
            Reg::R10 => regs.r10,
            Reg::R8 => regs.r8,
            Reg::R9 => regs.r9,
            Reg::Rsp => regs.rsp,
            Reg::OrigRax => regs.orig_rax,
        }
    }

    pub(crate) fn set(self, regs: &mut user_regs_struct, value: u64) {
        let slot = match self {
            Reg::Rdi => &mut regs.rdi,
            Reg::Rsi => &mut regs.rsi,
            Reg::Rdx => &mut regs.rdx,
            Reg::R10 => &mut regs.r10,
            Reg::R8 => &mut regs.r8,
            Reg::R9 => &mut regs.r9,
            Reg::Rsp => &mut regs.rsp,
            Reg::OrigRax => &mut regs.orig_rax,
        };
        *slot = value;
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Rdi => "rdi",
            Reg::Rsi => "rsi",
            Reg::Rdx => "rdx",
            Reg::R10 => "r10",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::Rsp => "rsp",
            Reg::OrigRax => "orig_rax",
        };
        f.write_str(name)
    }
}
