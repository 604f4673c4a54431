//! `env_logger` setup driven by [`LogConfig`] instead of `RUST_LOG`.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use env_logger::{Builder, Target};
use log::Level;

use crate::types::LogConfig;

/// One log line: status output is bare, everything else carries its level.
fn render(prefix: &str, level: Level, args: &fmt::Arguments<'_>) -> String {
    match level {
        Level::Info => format!("{}{}", prefix, args),
        _ => format!("{}{}: {}", prefix, level, args),
    }
}

/// Install the global logger. Appends to the configured file, or writes to
/// stderr when none is set.
pub(crate) fn init(config: &LogConfig) -> Result<()> {
    let prefix = config.prefix.clone();
    let mut builder = Builder::new();
    builder
        .filter_level(config.level_filter())
        .format(move |buf, record| {
            writeln!(buf, "{}", render(&prefix, record.level(), record.args()))
        });

    match config.file.as_deref().filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }

    builder.try_init().context("Failed to install logger")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_have_no_level_tag() {
        assert_eq!(
            render("STATUS: ", Level::Info, &format_args!("Exited: {} {}", 42, 0)),
            "STATUS: Exited: 42 0"
        );
    }

    #[test]
    fn diagnostic_lines_are_tagged() {
        assert_eq!(
            render("INTERCEPT: ", Level::Debug, &format_args!("Awaiting stop.")),
            "INTERCEPT: DEBUG: Awaiting stop."
        );
        assert_eq!(
            render("", Level::Error, &format_args!("Unexpected PID {}", 7)),
            "ERROR: Unexpected PID 7"
        );
    }
}
