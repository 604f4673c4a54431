//! End-to-end runs of the supervisor against `/bin/sh`.
//!
//! These need permission to ptrace a child process, which most CI
//! containers grant to the parent of the traced program.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Output};

use tempfile::TempDir;

const ENV_VARS: [&str; 6] = [
    "_PATH_INTERCEPTOR_THREADS",
    "_PATH_INTERCEPTOR_MATCH_REGEX",
    "_PATH_INTERCEPTOR_REPLACEMENT_STRING",
    "_PATH_INTERCEPTOR_DEBUG",
    "_PATH_INTERCEPTOR_LOG_FILE",
    "_PATH_INTERCEPTOR_LOG_PREFIX",
];

fn supervisor(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_intercept-files"));
    cmd.current_dir(dir);
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// A directory containing only `Bbc`, so `Abc` exists only if rewritten.
fn workdir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Bbc"), b"").unwrap();
    dir
}

fn shell(dir: &Path, opts: &[&str], script: &str) -> ExitStatus {
    supervisor(dir)
        .args(opts)
        .args(["/bin/sh", "-c", script])
        .status()
        .unwrap()
}

const REWRITE_A_TO_B: [&str; 6] = ["--match-regex", "^A", "--replacement", "B", "--debug", "0"];

#[test]
fn matching_path_is_redirected() {
    let dir = workdir();
    let status = shell(dir.path(), &REWRITE_A_TO_B, "test -e Abc");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn without_supervisor_the_path_is_missing() {
    let dir = workdir();
    let status = Command::new("/bin/sh")
        .args(["-c", "test -e Abc"])
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn non_matching_path_is_untouched() {
    let dir = workdir();
    fs::write(dir.path().join("ZZZ"), b"").unwrap();
    let status = shell(dir.path(), &REWRITE_A_TO_B, "test -e ZZZ");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn no_rule_passes_everything_through() {
    let dir = workdir();
    let status = shell(dir.path(), &["--debug", "0"], "test -e Abc");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn rewriting_is_stable_across_many_syscalls() {
    let dir = workdir();
    let script = "i=0; while [ $i -lt 100 ]; do test -e Abc || exit 1; i=$((i+1)); done";
    let status = shell(dir.path(), &REWRITE_A_TO_B, script);
    assert_eq!(status.code(), Some(0));
}

#[test]
fn subshell_is_rewritten_only_with_child_tracing() {
    let dir = workdir();
    let script = "(test -e Abc); status=$?; exit $status";

    let mut opts = REWRITE_A_TO_B.to_vec();
    opts.push("--trace-children");
    assert_eq!(shell(dir.path(), &opts, script).code(), Some(0));

    assert_eq!(shell(dir.path(), &REWRITE_A_TO_B, script).code(), Some(1));
}

#[test]
fn child_tracing_can_come_from_the_environment() {
    let dir = workdir();
    let status = supervisor(dir.path())
        .env("_PATH_INTERCEPTOR_THREADS", "1")
        .env("_PATH_INTERCEPTOR_MATCH_REGEX", "^A")
        .env("_PATH_INTERCEPTOR_REPLACEMENT_STRING", "B")
        .env("_PATH_INTERCEPTOR_DEBUG", "0")
        .args(["/bin/sh", "-c", "(test -e Abc); status=$?; exit $status"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn exit_code_is_propagated() {
    let dir = workdir();
    assert_eq!(shell(dir.path(), &["--debug", "0"], "exit 7").code(), Some(7));
    assert_eq!(shell(dir.path(), &["--debug", "0"], "exit 0").code(), Some(0));
}

#[test]
fn fatal_signal_is_propagated() {
    let dir = workdir();
    let status = shell(dir.path(), &["--debug", "0"], "kill -TERM $$");
    assert_eq!(status.code(), None);
    assert_eq!(status.signal(), Some(libc::SIGTERM));
}

#[test]
fn descendant_surviving_a_fatal_signal_stays_rewritten() {
    let dir = workdir();
    let mut opts = REWRITE_A_TO_B.to_vec();
    opts.push("--trace-children");
    let script = r#"/bin/sh -c 'trap "" TERM; kill -TERM $$; test -e Abc'; exit $?"#;
    assert_eq!(shell(dir.path(), &opts, script).code(), Some(0));
}

#[test]
fn unknown_command_exits_like_the_shell() {
    let dir = workdir();
    let status = supervisor(dir.path())
        .args(["--debug", "0", "/nonexistent/intercept-files-test"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(127));
}

#[test]
fn missing_command_is_rejected() {
    let dir = workdir();
    let output: Output = supervisor(dir.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty());
}

#[test]
fn help_exits_successfully() {
    let dir = workdir();
    let output = supervisor(dir.path()).arg("--help").output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--match-regex"));
    assert!(help.contains("_PATH_INTERCEPTOR_MATCH_REGEX"));
}

#[test]
fn invalid_pattern_is_rejected_before_running() {
    let dir = workdir();
    let output = supervisor(dir.path())
        .args(["--match-regex", "(", "--replacement", "x"])
        .args(["/bin/sh", "-c", "touch ran"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("ran").exists());
}

#[test]
fn substitutions_are_logged_to_file() {
    let dir = workdir();
    let log = dir.path().join("intercept.log");
    let status = supervisor(dir.path())
        .args(["--match-regex", "^A", "--replacement", "B"])
        .args(["--log-prefix", "INTERCEPT: "])
        .arg("--log-file")
        .arg(&log)
        .args(["/bin/sh", "-c", "test -e Abc"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let text = fs::read_to_string(&log).unwrap();
    let line = text
        .lines()
        .find(|l| l.contains("Intercepted and substituted path"))
        .expect("no substitution logged");
    assert!(line.starts_with("INTERCEPT: "));
    assert!(line.contains("Abc -> Bbc"));
}

#[test]
fn debug_zero_is_silent() {
    let dir = workdir();
    let output = supervisor(dir.path())
        .args(REWRITE_A_TO_B)
        .args(["/bin/sh", "-c", "test -e Abc"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(output.stderr.is_empty());
}
