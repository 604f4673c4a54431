//! Word-granular access to a stopped tracee's registers and memory.
//!
//! [`read_path`] pulls a NUL-terminated path out of the tracee one machine
//! word at a time; [`write_path`] plants a replacement below the stack
//! pointer and repoints the argument register at it.

use std::mem::size_of;

use libc::c_long;
use log::trace;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use thiserror::Error;

use crate::regs::Reg;

pub(crate) const PATH_MAX: usize = libc::PATH_MAX as usize;

const WORD: usize = size_of::<c_long>();

/// Bytes below the stack pointer the System V ABI lets leaf code use freely.
const RED_ZONE: u64 = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum MemoryError {
    #[error("cannot access register {reg}: {errno}")]
    Register { reg: Reg, errno: Errno },
    #[error("cannot read tracee memory at {addr:#x}: {errno}")]
    Read {
        addr: u64,
        errno: Errno,
        partial: Vec<u8>,
    },
    #[error("no NUL terminator within {} bytes", PATH_MAX)]
    Unterminated { partial: Vec<u8> },
    #[error("cannot write tracee memory at {addr:#x}: {errno}")]
    Write { addr: u64, errno: Errno },
    #[error("replacement path is {len} bytes, limit is {}", PATH_MAX - 1)]
    TooLong { len: usize },
}

impl MemoryError {
    /// Bytes read before the failure, kept for diagnostics only.
    pub(crate) fn partial(&self) -> &[u8] {
        match self {
            MemoryError::Read { partial, .. } | MemoryError::Unterminated { partial } => partial,
            _ => &[],
        }
    }
}

/// The narrow channel into a stopped tracee: single words of memory and
/// single registers.
pub(crate) trait TraceeMemory {
    fn peek(&self, addr: u64) -> nix::Result<c_long>;
    fn poke(&mut self, addr: u64, word: c_long) -> nix::Result<()>;
    fn register(&self, reg: Reg) -> nix::Result<u64>;
    fn set_register(&mut self, reg: Reg, value: u64) -> nix::Result<()>;
}

/// A tracee in ptrace-stop, accessed through `PTRACE_PEEKDATA`,
/// `PTRACE_POKEDATA` and the register set.
pub(crate) struct Tracee {
    pub(crate) pid: Pid,
}

impl TraceeMemory for Tracee {
    fn peek(&self, addr: u64) -> nix::Result<c_long> {
        ptrace::read(self.pid, addr as ptrace::AddressType)
    }

    fn poke(&mut self, addr: u64, word: c_long) -> nix::Result<()> {
        ptrace::write(self.pid, addr as ptrace::AddressType, word)
    }

    fn register(&self, reg: Reg) -> nix::Result<u64> {
        let regs = ptrace::getregs(self.pid)?;
        Ok(reg.get(&regs))
    }

    fn set_register(&mut self, reg: Reg, value: u64) -> nix::Result<()> {
        let mut regs = ptrace::getregs(self.pid)?;
        reg.set(&mut regs, value);
        ptrace::setregs(self.pid, regs)
    }
}

/// Read the NUL-terminated path pointed to by `reg`.
///
/// Words are read at aligned addresses, so a string ending just before an
/// unmapped page never faults on the bytes past its terminator.
pub(crate) fn read_path<M: TraceeMemory>(mem: &M, reg: Reg) -> Result<Vec<u8>, MemoryError> {
    let start = mem
        .register(reg)
        .map_err(|errno| MemoryError::Register { reg, errno })?;
    let mut addr = start & !(WORD as u64 - 1);
    let mut skip = (start - addr) as usize;
    let mut path = Vec::new();

    loop {
        let word = match mem.peek(addr) {
            Ok(word) => word,
            Err(errno) => {
                return Err(MemoryError::Read {
                    addr,
                    errno,
                    partial: path,
                });
            }
        };

        for byte in word.to_ne_bytes().into_iter().skip(skip) {
            if byte == 0 {
                return Ok(path);
            }
            path.push(byte);
        }
        skip = 0;

        if path.len() >= PATH_MAX {
            path.truncate(PATH_MAX);
            return Err(MemoryError::Unterminated { partial: path });
        }
        addr += WORD as u64;
    }
}

/// Where the replacement for `reg` goes: past the red zone, one
/// `PATH_MAX` slot per argument position so two rewritten paths of the
/// same syscall never overlap.
fn scratch_address(rsp: u64, reg: Reg) -> u64 {
    let slot = reg.arg_position().unwrap_or(0) as u64 + 1;
    rsp.wrapping_sub(RED_ZONE + PATH_MAX as u64 * slot) & !(WORD as u64 - 1)
}

/// Write `new_path` into the tracee's unused stack and point `reg` at it.
///
/// Returns the address the path was written to.
pub(crate) fn write_path<M: TraceeMemory>(
    mem: &mut M,
    reg: Reg,
    new_path: &[u8],
) -> Result<u64, MemoryError> {
    if new_path.len() >= PATH_MAX {
        return Err(MemoryError::TooLong {
            len: new_path.len(),
        });
    }

    let rsp = mem.register(Reg::Rsp).map_err(|errno| MemoryError::Register {
        reg: Reg::Rsp,
        errno,
    })?;
    let start = scratch_address(rsp, reg);

    let mut terminated = new_path.to_vec();
    terminated.push(0);

    let mut addr = start;
    for chunk in terminated.chunks(WORD) {
        let mut bytes = [0u8; WORD];
        bytes[..chunk.len()].copy_from_slice(chunk);
        mem.poke(addr, c_long::from_ne_bytes(bytes))
            .map_err(|errno| MemoryError::Write { addr, errno })?;
        addr += WORD as u64;
    }
    trace!("wrote {} bytes at {:#x}", terminated.len(), start);

    mem.set_register(reg, start)
        .map_err(|errno| MemoryError::Register { reg, errno })?;
    Ok(start)
}
