//! Syscall-stop handling: tell entry from exit and rewrite path arguments
//! on entry.

use log::{debug, error, info, trace};
use nix::unistd::Pid;

use crate::memory::{self, Tracee, TraceeMemory};
use crate::regs::Reg;
use crate::tracker::TrackerError;
use crate::types::Phase;
use crate::{Tracer, syscalls};

impl Tracer<'_> {
    /// One syscall-stop of a tracked tracee. Only entry stops do any work;
    /// by exit the kernel has already consumed the arguments.
    pub(crate) fn handle_syscall_stop(&mut self, pid: Pid) -> Result<(), TrackerError> {
        match self.advance_phase(pid)? {
            Phase::OutsideSyscall => {
                trace!("Syscall entry: {}", pid);
                let mut tracee = Tracee { pid };
                self.intercept_entry(&mut tracee, pid);
            }
            Phase::InsideSyscall => trace!("Syscall exit: {}", pid),
        }
        Ok(())
    }

    /// Flip the tracee's phase, returning the one this stop belongs to.
    fn advance_phase(&mut self, pid: Pid) -> Result<Phase, TrackerError> {
        let phase = self.tracker.get(pid)?;
        self.tracker.set(pid, phase.flipped())?;
        Ok(phase)
    }

    /// Rewrite every path argument of the syscall `mem` is entering.
    /// Failures are logged per argument and never stop the tracee.
    ///
    /// Returns the number of arguments rewritten.
    pub(crate) fn intercept_entry<M: TraceeMemory>(&mut self, mem: &mut M, pid: Pid) -> usize {
        let nr = match mem.register(Reg::OrigRax) {
            Ok(nr) => nr as i64,
            Err(e) => {
                error!("Cannot read syscall number of {}: {}", pid, e);
                return 0;
            }
        };
        let Some(desc) = syscalls::resolve(nr) else {
            trace!("Skipping uninteresting syscall ({} {}).", pid, nr);
            return 0;
        };
        debug!("Handling syscall '{}' ({} {}).", desc.name, pid, nr);

        desc.pre_hook.run(desc, pid);
        let mut rewritten = 0;
        for &reg in desc.path_args {
            let path = match memory::read_path(&*mem, reg) {
                Ok(path) => path,
                Err(e) => {
                    error!(
                        "Cannot read path argument (PID {} {} REG {}): {}",
                        pid, desc.name, reg, e
                    );
                    debug!("Partial path: {}", String::from_utf8_lossy(e.partial()));
                    continue;
                }
            };

            let Some(new_path) = self.policy.rewrite(&path) else {
                continue;
            };
            if let Err(e) = memory::write_path(mem, reg, &new_path) {
                error!(
                    "Cannot substitute path (PID {} {} REG {}): {}",
                    pid, desc.name, reg, e
                );
                continue;
            }
            info!(
                "Intercepted and substituted path (PID {} {} REG {}): {} -> {}",
                pid,
                desc.name,
                reg,
                String::from_utf8_lossy(&path),
                String::from_utf8_lossy(&new_path)
            );
            rewritten += 1;
        }
        desc.post_hook.run(desc, pid);
        rewritten
    }
}
