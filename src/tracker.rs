//! Per-tracee syscall phase bookkeeping.
//!
//! Every live tracee owns exactly one slot holding its [`Phase`]. Slots are
//! scanned linearly: the number of concurrent threads and processes under a
//! single supervisor is small, and the one-entry cache catches the usual
//! case of the same tracee stopping again and again.

use std::cell::Cell;

use log::{trace, warn};
use nix::unistd::Pid;
use thiserror::Error;

use crate::types::Phase;

const INITIAL_SLOTS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum TrackerError {
    #[error("tracee {0} is not tracked")]
    Untracked(Pid),
    #[error("shrinking the tracee table is not supported: {from} -> {to}")]
    Shrink { from: usize, to: usize },
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    live: bool,
    pid: Pid,
    phase: Phase,
}

impl Slot {
    const FREE: Slot = Slot {
        live: false,
        pid: Pid::from_raw(0),
        phase: Phase::OutsideSyscall,
    };
}

/// Maps tracee ids to their current syscall [`Phase`].
///
/// Removed slots become free and are reused by later registrations. The
/// table only ever grows.
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    slots: Vec<Slot>,
    recent: Cell<Option<(Pid, usize)>>,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        PhaseTracker {
            slots: vec![Slot::FREE; INITIAL_SLOTS],
            recent: Cell::new(None),
        }
    }

    /// Number of slots, live or free.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    /// Start tracking `pid` as outside any syscall.
    ///
    /// Registering an id twice is a caller bug; it is logged and the
    /// existing entry is reset rather than duplicated.
    pub(crate) fn register(&mut self, pid: Pid) -> Result<(), TrackerError> {
        trace!("registering tracee {}", pid);
        if let Some(idx) = self.index_of(pid) {
            warn!("tracee {} is already registered", pid);
            self.slots[idx].phase = Phase::OutsideSyscall;
            return Ok(());
        }
        let idx = self.free_index()?;
        self.slots[idx] = Slot {
            live: true,
            pid,
            phase: Phase::OutsideSyscall,
        };
        Ok(())
    }

    pub(crate) fn has(&self, pid: Pid) -> bool {
        self.index_of(pid).is_some()
    }

    pub(crate) fn get(&self, pid: Pid) -> Result<Phase, TrackerError> {
        let idx = self.index_of(pid).ok_or(TrackerError::Untracked(pid))?;
        Ok(self.slots[idx].phase)
    }

    pub(crate) fn set(&mut self, pid: Pid, phase: Phase) -> Result<(), TrackerError> {
        trace!("tracee {} is now {:?}", pid, phase);
        let idx = self.index_of(pid).ok_or(TrackerError::Untracked(pid))?;
        self.slots[idx].phase = phase;
        Ok(())
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> Result<(), TrackerError> {
        trace!("removing tracee {}", pid);
        let idx = self.index_of(pid).ok_or(TrackerError::Untracked(pid))?;
        self.slots[idx] = Slot::FREE;
        if matches!(self.recent.get(), Some((_, cached)) if cached == idx) {
            self.recent.set(None);
        }
        Ok(())
    }

    /// Resize the slot table to `new_len`, keeping every existing entry.
    fn resize(&mut self, new_len: usize) -> Result<(), TrackerError> {
        if new_len < self.slots.len() {
            return Err(TrackerError::Shrink {
                from: self.slots.len(),
                to: new_len,
            });
        }
        trace!("resizing tracee table: {} -> {}", self.slots.len(), new_len);
        self.slots.resize(new_len, Slot::FREE);
        Ok(())
    }

    fn grow(&mut self) -> Result<(), TrackerError> {
        let len = self.slots.len();
        self.resize(len + len * 3 / 10 + 5)
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        if let Some((cached_pid, idx)) = self.recent.get()
            && cached_pid == pid
            && self.slots[idx].live
            && self.slots[idx].pid == pid
        {
            return Some(idx);
        }
        let idx = self.slots.iter().position(|s| s.live && s.pid == pid)?;
        self.recent.set(Some((pid, idx)));
        Some(idx)
    }

    fn free_index(&mut self) -> Result<usize, TrackerError> {
        if let Some(idx) = self.slots.iter().position(|s| !s.live) {
            return Ok(idx);
        }
        let idx = self.slots.len();
        self.grow()?;
        Ok(idx)
    }
}
