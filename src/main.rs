//! intercept-files: rewrite the filesystem paths a program passes to the kernel.
//!
//! Runs a command under ptrace, stops it (and optionally every thread and
//! child process it creates) at each syscall entry, and substitutes the
//! first regex match in every path argument before the kernel sees it.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("intercept-files only supports the x86_64 Linux syscall ABI");

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::builder::FalseyValueParser;
use log::{debug, error, info, trace};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, SigHandler};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use std::path::PathBuf;

mod handlers;
mod logging;
mod memory;
mod ptrace_ops;
mod regs;
mod rewrite;
mod syscalls;
mod tracker;
mod types;

use rewrite::RewritePolicy;
use tracker::PhaseTracker;
use types::{Config, LogConfig, RewriteRule, TraceeExit};

const LONG_ABOUT: &str = "\
Intercept most Linux system calls that handle filepaths, and replace a REGEX \
match in all paths passed to them with a fixed string.

Every option can also be set through the environment variable shown next to \
it, so several instances can share one configuration.";

#[derive(Parser, Debug)]
#[command(name = "intercept-files", version)]
#[command(about = "Rewrite filesystem paths in the syscalls of a traced program")]
#[command(long_about = LONG_ABOUT)]
struct Args {
    /// Also intercept threads and child processes (recommended unless the
    /// program is known to use neither)
    #[arg(long, env = "_PATH_INTERCEPTOR_THREADS", value_parser = FalseyValueParser::new())]
    trace_children: bool,

    /// POSIX extended regular expression matched against intercepted paths
    #[arg(long, env = "_PATH_INTERCEPTOR_MATCH_REGEX", value_name = "REGEX")]
    match_regex: Option<String>,

    /// Literal text that replaces the first match in a path
    #[arg(
        long,
        env = "_PATH_INTERCEPTOR_REPLACEMENT_STRING",
        value_name = "STRING"
    )]
    replacement: Option<String>,

    /// Log detail: 0 disables logging, 1 is status messages, higher values
    /// add increasingly detailed debug output
    #[arg(
        long = "debug",
        env = "_PATH_INTERCEPTOR_DEBUG",
        value_name = "LEVEL",
        default_value = "1",
        value_parser = parse_debug_level
    )]
    debug_level: u8,

    /// Append log messages to this file instead of stderr
    #[arg(long, env = "_PATH_INTERCEPTOR_LOG_FILE", value_name = "PATH")]
    log_file: Option<String>,

    /// Prefix for every log line
    #[arg(long, env = "_PATH_INTERCEPTOR_LOG_PREFIX", default_value = "STATUS: ")]
    log_prefix: String,

    /// Command to run, followed by its arguments
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

/// Accepts decimal, `0x` hex and `0` octal like `strtol`; empty means the default.
fn parse_debug_level(s: &str) -> Result<u8, std::num::ParseIntError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(1);
    }
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)?
    } else {
        digits.parse::<i64>()?
    };
    if negative {
        return Ok(0);
    }
    Ok(value.clamp(0, u8::MAX as i64) as u8)
}

impl Args {
    fn config(&self) -> Config {
        Config {
            trace_children: self.trace_children,
            rewrite: RewriteRule::from_parts(self.match_regex.clone(), self.replacement.clone()),
            log: LogConfig {
                level: self.debug_level,
                file: self
                    .log_file
                    .as_ref()
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
                prefix: self.log_prefix.clone(),
            },
        }
    }
}

/// The tracing supervisor.
///
/// Owns the phase tracker and the rewrite policy; both are touched only from
/// the wait loop. Methods are spread across `ptrace_ops` (stop, event and
/// exit classification) and `handlers` (syscall-entry interception).
pub(crate) struct Tracer<'a> {
    pub(crate) config: &'a Config,
    pub(crate) tracker: PhaseTracker,
    pub(crate) policy: RewritePolicy,
    pub(crate) initial_pid: Pid,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(config: &'a Config, policy: RewritePolicy, initial_pid: Pid) -> Self {
        Tracer {
            config,
            tracker: PhaseTracker::new(),
            policy,
            initial_pid,
        }
    }

    /// Drive the tracees until the traced command terminates.
    fn run(&mut self) -> Result<TraceeExit> {
        info!("Starting main target: {}", self.initial_pid);
        self.tracker.register(self.initial_pid)?;
        ptrace::syscall(self.initial_pid, None).context("Failed to start the main target")?;

        loop {
            trace!("Awaiting stop.");
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    bail!("All tracees vanished before main target {} exited", self.initial_pid)
                }
                Err(e) => return Err(e).context("waitpid failed"),
            };
            trace!("Awaited stop: {:?}", status);

            if let Some(exit) = self.handle_status(status)? {
                return Ok(exit);
            }
        }
    }
}

/// Leave with the same status as the traced command.
fn exit_like(exit: TraceeExit) -> ! {
    if let TraceeExit::Signal(sig) = exit {
        // SAFETY: restores the default action; no handler of ours is involved.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
        let _ = signal::raise(sig);
    }
    std::process::exit(exit.as_code())
}

/// Log a supervisor failure and return the status to exit with. Tracker
/// invariant violations end up here like any other error.
pub(crate) fn failure_status(e: &anyhow::Error) -> i32 {
    error!("{:#}", e);
    1
}

fn trace_command(config: &Config, command: &[String]) -> Result<TraceeExit> {
    // Compile the pattern before the target starts so a bad one fails fast.
    let policy = RewritePolicy::new(config.rewrite.clone())?;
    if !policy.is_active() {
        info!("No path replacer defined; paths pass through unchanged.");
    }
    debug!("Intercepting {} syscalls", syscalls::table().len());

    let pid = ptrace_ops::spawn_traced(command, config)?;
    Tracer::new(config, policy, pid).run()
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    let config = args.config();

    if let Err(e) = logging::init(&config.log) {
        eprintln!("intercept-files: {:#}", e);
        std::process::exit(1);
    }

    match trace_command(&config, &args.command) {
        Ok(exit) => exit_like(exit),
        Err(e) => std::process::exit(failure_status(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn command_and_its_flags_are_kept_verbatim() {
        let args = parse(&["intercept-files", "ls", "-la", "--color", "/tmp"]);
        assert_eq!(args.command, ["ls", "-la", "--color", "/tmp"]);
    }

    #[test]
    fn own_options_precede_command() {
        let args = parse(&[
            "intercept-files",
            "--trace-children",
            "--match-regex",
            "^A",
            "--replacement",
            "B",
            "--debug",
            "3",
            "sh",
            "-c",
            "stat Abc",
        ]);
        let config = args.config();
        assert!(config.trace_children);
        assert_eq!(
            config.rewrite,
            Some(RewriteRule {
                pattern: "^A".into(),
                replacement: "B".into(),
            })
        );
        assert_eq!(config.log.level, 3);
        assert_eq!(args.command, ["sh", "-c", "stat Abc"]);
    }

    #[test]
    fn missing_command_is_an_error() {
        let err = Args::try_parse_from(["intercept-files"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn pattern_without_replacement_disables_rewriting() {
        let args = parse(&["intercept-files", "--match-regex", "^A", "true"]);
        assert_eq!(args.config().rewrite, None);
    }

    #[test]
    fn empty_log_file_means_stderr() {
        let args = parse(&["intercept-files", "--log-file", "", "true"]);
        assert_eq!(args.config().log.file, None);
        let args = parse(&["intercept-files", "--log-file", "/tmp/x.log", "true"]);
        assert_eq!(args.config().log.file, Some(PathBuf::from("/tmp/x.log")));
    }

    #[test]
    fn debug_level_parses_like_strtol() {
        assert_eq!(parse_debug_level(""), Ok(1));
        assert_eq!(parse_debug_level("0"), Ok(0));
        assert_eq!(parse_debug_level("4"), Ok(4));
        assert_eq!(parse_debug_level("0x10"), Ok(16));
        assert_eq!(parse_debug_level("010"), Ok(8));
        assert_eq!(parse_debug_level("-2"), Ok(0));
        assert_eq!(parse_debug_level("9999"), Ok(255));
        assert!(parse_debug_level("loud").is_err());
    }

    #[test]
    fn tracker_violation_fails_with_status_one() {
        let err = anyhow::Error::new(tracker::TrackerError::Shrink { from: 5, to: 2 })
            .context("Tracing failed");
        assert_eq!(failure_status(&err), 1);
    }
}
