//! Shared data types used across the supervisor.
//!
//! Contains the resolved configuration ([`Config`], [`LogConfig`],
//! [`RewriteRule`]), the per-tracee syscall [`Phase`], and the
//! [`TraceeExit`] status the supervisor hands back to `main`.

use std::path::PathBuf;

use log::LevelFilter;
use nix::sys::signal::Signal;

/// Immutable configuration for the supervisor, resolved once at startup.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) trace_children: bool,
    pub(crate) rewrite: Option<RewriteRule>,
    pub(crate) log: LogConfig,
}

/// A single match/replace rule applied to intercepted paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RewriteRule {
    pub(crate) pattern: String,
    pub(crate) replacement: String,
}

impl RewriteRule {
    /// Only a pattern together with a replacement makes a rule.
    pub(crate) fn from_parts(pattern: Option<String>, replacement: Option<String>) -> Option<Self> {
        match (pattern, replacement) {
            (Some(pattern), Some(replacement)) => Some(RewriteRule {
                pattern,
                replacement,
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LogConfig {
    pub(crate) level: u8,
    pub(crate) file: Option<PathBuf>,
    pub(crate) prefix: String,
}

impl LogConfig {
    /// Map the numeric verbosity onto `log` levels.
    ///
    /// `0` silences everything, `1` is status output only, `2` adds
    /// per-syscall debugging and anything above that traces every stop.
    pub(crate) fn level_filter(&self) -> LevelFilter {
        match self.level {
            0 => LevelFilter::Off,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Where a tracee is relative to its current system call.
///
/// Syscall-entry and syscall-exit stops look identical to the tracer, so
/// this toggle is the only way to tell them apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Phase {
    #[default]
    OutsideSyscall,
    InsideSyscall,
}

impl Phase {
    pub(crate) fn flipped(self) -> Phase {
        match self {
            Phase::OutsideSyscall => Phase::InsideSyscall,
            Phase::InsideSyscall => Phase::OutsideSyscall,
        }
    }
}

/// How the traced command ended; becomes the supervisor's own status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TraceeExit {
    Code(i32),
    Signal(Signal),
}

impl TraceeExit {
    /// Shell-style numeric status, used when a signal cannot be re-raised.
    pub(crate) fn as_code(self) -> i32 {
        match self {
            TraceeExit::Code(code) => code,
            TraceeExit::Signal(sig) => 128 + sig as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_config(level: u8) -> LogConfig {
        LogConfig {
            level,
            file: None,
            prefix: "STATUS: ".to_string(),
        }
    }

    #[test]
    fn level_zero_disables_logging() {
        assert_eq!(log_config(0).level_filter(), LevelFilter::Off);
    }

    #[test]
    fn level_one_is_status_only() {
        assert_eq!(log_config(1).level_filter(), LevelFilter::Info);
    }

    #[test]
    fn higher_levels_add_detail() {
        assert_eq!(log_config(2).level_filter(), LevelFilter::Debug);
        assert_eq!(log_config(3).level_filter(), LevelFilter::Trace);
        assert_eq!(log_config(9).level_filter(), LevelFilter::Trace);
    }

    #[test]
    fn rule_needs_both_parts() {
        assert_eq!(RewriteRule::from_parts(Some("^A".into()), None), None);
        assert_eq!(RewriteRule::from_parts(None, Some("B".into())), None);
        assert_eq!(
            RewriteRule::from_parts(Some("^A".into()), Some("B".into())),
            Some(RewriteRule {
                pattern: "^A".into(),
                replacement: "B".into(),
            })
        );
    }

    #[test]
    fn phase_flips_both_ways() {
        assert_eq!(Phase::default(), Phase::OutsideSyscall);
        assert_eq!(Phase::OutsideSyscall.flipped(), Phase::InsideSyscall);
        assert_eq!(Phase::InsideSyscall.flipped(), Phase::OutsideSyscall);
    }

    #[test]
    fn signal_exit_maps_to_shell_code() {
        assert_eq!(TraceeExit::Code(7).as_code(), 7);
        assert_eq!(TraceeExit::Signal(Signal::SIGTERM).as_code(), 143);
    }
}
