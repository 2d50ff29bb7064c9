//! Tracing setup for the gateway.
//!
//! Text or JSON output, to stderr or to an append-mode file, with a
//! verbosity-derived default filter that `RUST_LOG` overrides.

use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Map a `-v` count to a level name (0=error .. 4+=trace).
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Default filter directive covering the gateway crates.
pub fn default_directive(verbosity: u8) -> String {
    let level = level_for_verbosity(verbosity);
    format!(
        "termgate={level},termgate_core={level},termgate_server={level}",
        level = level
    )
}

/// Initialize the logging system.
///
/// `verbosity` selects the default level, `log_file` redirects output to a
/// file opened in append mode.
///
/// ```ignore
/// use termgate_core::logging::{init_logging, LogFormat};
///
/// init_logging(2, None, LogFormat::Text).unwrap();
/// ```
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    let detailed = verbosity >= 3;

    let file = match log_file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (file, format) {
        (None, LogFormat::Text) => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init(),
        (None, LogFormat::Json) => registry.with(fmt::layer().json()).try_init(),
        (Some(file), LogFormat::Text) => registry
            .with(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init(),
        (Some(file), LogFormat::Json) => registry
            .with(fmt::layer().json().with_writer(Mutex::new(file)))
            .try_init(),
    };

    result.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

/// Initialize logging with defaults for testing.
///
/// Errors are ignored since a subscriber may already be installed.
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}
