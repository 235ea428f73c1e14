//! Logging construction helpers shared by the workspace.
//!
//! Re-exports the slog macros so users write `logging::debug!(...)` and
//! builds terminal loggers via sloggers. Library objects accept an optional
//! parent logger and fall back to a discarding one.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Build a terminal logger for the given severity name. Unknown names fall
/// back to `info`.
pub fn init(level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warning" | "warn" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger construction failed")
}

/// Derive a child logger from an optional parent, discarding if absent.
pub fn child_or_discard<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
