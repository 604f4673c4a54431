//! Ptrace lifecycle management: spawning, stop/event/exit handling.
//!
//! Contains the [`spawn_traced`] entry point plus the `Tracer` methods that
//! classify waitpid statuses (syscall-stops, fork/clone/exec events, signal
//! stops and terminations).

use anyhow::{Context, Result, bail};
use log::{debug, error, info, trace};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execvp, fork};
use std::ffi::CString;

use crate::Tracer;
use crate::types::*;

/// Stop signals that end the tracee that received them.
const FATAL_SIGNALS: [Signal; 9] = [
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGKILL,
    Signal::SIGPIPE,
];

/// Exit status of a child that could not exec its command, as in the shell.
const EXEC_FAILED: i32 = 127;

fn trace_options(config: &Config) -> ptrace::Options {
    let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_TRACEEXEC;
    if config.trace_children {
        options |= ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK;
    }
    options
}

/// Human-readable name of a creation event, or `None` for other events.
fn creation_verb(event: i32) -> Option<&'static str> {
    match event {
        e if e == ptrace::Event::PTRACE_EVENT_FORK as i32 => Some("Forked"),
        e if e == ptrace::Event::PTRACE_EVENT_VFORK as i32 => Some("V-Forked"),
        e if e == ptrace::Event::PTRACE_EVENT_CLONE as i32 => Some("Cloned"),
        _ => None,
    }
}

impl Tracer<'_> {
    /// Act on one waitpid status. Returns the traced command's termination
    /// once it has happened; tracing stops there.
    pub(crate) fn handle_status(&mut self, status: WaitStatus) -> Result<Option<TraceeExit>> {
        match status {
            WaitStatus::PtraceSyscall(pid) => {
                if !self.tracker.has(pid) {
                    self.detach_unknown(pid);
                    return Ok(None);
                }
                self.handle_syscall_stop(pid)?;
                self.resume(pid, None);
                Ok(None)
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                if !self.tracker.has(pid) {
                    self.detach_unknown(pid);
                    return Ok(None);
                }
                self.handle_ptrace_event(pid, event)?;
                Ok(None)
            }
            WaitStatus::Stopped(pid, sig) => self.handle_signal_stop(pid, sig),
            WaitStatus::Exited(pid, code) => {
                Ok(self.handle_termination(pid, TraceeExit::Code(code))?)
            }
            WaitStatus::Signaled(pid, sig, _) => {
                Ok(self.handle_termination(pid, TraceeExit::Signal(sig))?)
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(None),
        }
    }

    /// Fork, vfork, clone and exec notifications.
    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<()> {
        if let Some(verb) = creation_verb(event) {
            return self.handle_new_tracee(pid, verb);
        }
        if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            self.handle_exec(pid)?;
        } else {
            debug!("Ignoring ptrace event {} from {}", event, pid);
        }
        self.resume(pid, None);
        Ok(())
    }

    fn handle_new_tracee(&mut self, pid: Pid, verb: &str) -> Result<()> {
        let child = match ptrace::getevent(pid) {
            Ok(raw) => Pid::from_raw(raw as i32),
            Err(e) => {
                error!("Cannot read new tracee id from {}: {}", pid, e);
                self.resume(pid, None);
                return Ok(());
            }
        };
        info!("{} new PID: {} -> {}", verb, pid, child);
        self.resume(pid, None);

        // Its first stop may already have been seen and registered.
        if self.tracker.has(child) {
            debug!("{} PID already recognized: {}", verb, child);
            return Ok(());
        }
        self.tracker.register(child)?;
        self.resume(child, None);
        Ok(())
    }

    /// After a successful execve the tracee is about to take the syscall-exit
    /// stop. When a non-leader thread exec'd, it now carries the leader's
    /// id and its old thread id is gone without an exit report.
    fn handle_exec(&mut self, pid: Pid) -> Result<()> {
        match ptrace::getevent(pid) {
            Ok(raw) => {
                let former = Pid::from_raw(raw as i32);
                if former != pid {
                    info!("Thread {} exec'd and became {}", former, pid);
                    if self.tracker.has(former) {
                        self.tracker.remove(former)?;
                    }
                }
            }
            Err(e) => debug!("Cannot read former thread id of {}: {}", pid, e),
        }
        self.tracker.set(pid, Phase::InsideSyscall)?;
        Ok(())
    }

    fn handle_signal_stop(&mut self, pid: Pid, sig: Signal) -> Result<Option<TraceeExit>> {
        if !self.tracker.has(pid) {
            if sig == Signal::SIGSTOP && self.config.trace_children {
                debug!("First stop of {} arrived before its creation event", pid);
                self.tracker.register(pid)?;
                self.resume(pid, None);
            } else {
                self.detach_unknown(pid);
            }
            return Ok(None);
        }

        // A descendant may ignore or handle the signal, so it stays tracked
        // until its termination is reported.
        if FATAL_SIGNALS.contains(&sig) {
            info!("Killed ({}): {}", sig, pid);
            self.resume(pid, Some(sig));
            if pid == self.initial_pid {
                info!("Main target {} killed by {}", pid, sig);
                return Ok(Some(TraceeExit::Signal(sig)));
            }
            return Ok(None);
        }

        match sig {
            Signal::SIGTRAP | Signal::SIGSTOP => {
                trace!("Suppressing {} for {}", sig, pid);
                self.resume(pid, None);
            }
            _ => {
                debug!("Forwarding {} to {}", sig, pid);
                self.resume(pid, Some(sig));
            }
        }
        Ok(None)
    }

    fn handle_termination(
        &mut self,
        pid: Pid,
        exit: TraceeExit,
    ) -> Result<Option<TraceeExit>, crate::tracker::TrackerError> {
        if pid != self.initial_pid && !self.tracker.has(pid) {
            debug!("Termination of untracked PID {}: {:?}", pid, exit);
            return Ok(None);
        }
        match exit {
            TraceeExit::Code(code) => info!("Exited: {} {}", pid, code),
            TraceeExit::Signal(sig) => info!("Terminated ({}): {}", sig, pid),
        }

        if pid == self.initial_pid {
            return Ok(Some(exit));
        }
        self.tracker.remove(pid)?;
        debug!("{} tracees remain", self.tracker.len());
        Ok(None)
    }

    /// Continue `pid` to its next syscall stop. A tracee that vanished in
    /// the meantime is not an error; its termination is reported by waitpid.
    pub(crate) fn resume(&self, pid: Pid, sig: Option<Signal>) {
        if let Err(e) = ptrace::syscall(pid, sig) {
            debug!("Cannot resume {}: {}", pid, e);
        }
    }

    fn detach_unknown(&self, pid: Pid) {
        error!("Unexpected PID {}. Where did this come from? Detaching.", pid);
        if let Err(e) = ptrace::detach(pid, None) {
            debug!("Cannot detach {}: {}", pid, e);
        }
    }
}

/// Fork and exec `command` under ptrace.
///
/// The child calls `PTRACE_TRACEME` and stops itself before `execvp`, so the
/// exec is already traced and its path can be rewritten too. The parent
/// waits for that stop, sets the trace options and returns the child's pid.
pub(crate) fn spawn_traced(command: &[String], config: &Config) -> Result<Pid> {
    let Some(program) = command.first() else {
        bail!("No command given");
    };
    // Built before fork so the child does not allocate.
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<CString>, _>>()
        .context("Command line contains a NUL byte")?;
    let not_started = format!("Cannot start {}", program);

    // SAFETY: the child only calls async-signal-safe functions before exec.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            match waitpid(child, None).context("Failed to wait for the new target")? {
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if pid == child => {}
                other => bail!("{}: unexpected first stop {:?}", not_started, other),
            }
            ptrace::setoptions(child, trace_options(config))
                .context("Failed to set ptrace options")?;
            Ok(child)
        }
        ForkResult::Child => {
            if ptrace::traceme().is_err() || signal::raise(Signal::SIGSTOP).is_err() {
                // SAFETY: leaves the forked child without running any handlers.
                unsafe { libc::_exit(1) };
            }
            let Err(e) = execvp(&argv[0], &argv);
            eprintln!("{}: {}", not_started, e);
            // SAFETY: as above.
            unsafe { libc::_exit(EXEC_FAILED) }
        }
    }
}
