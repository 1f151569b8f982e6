//! Diagnostic logging via `tracing` + `tracing-subscriber`, written to stderr.
//!
//! Filter priority:
//! 1. `-v` / `-q` on the command line (an explicit level)
//! 2. `DRIFTD_LOG` (any `EnvFilter` directive, e.g. `drift_agent=debug`)
//! 3. `info`

#![allow(missing_docs)]

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::core::errors::{DriftError, Result};

pub const LOG_ENV: &str = "DRIFTD_LOG";

/// Map `-v` / `-q` counts onto a level; `None` defers to the environment.
pub fn level_from_flags(verbose: u8, quiet: bool) -> Option<tracing::Level> {
    if quiet {
        return Some(tracing::Level::ERROR);
    }
    match verbose {
        0 => None,
        1 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

fn build_filter(level: Option<tracing::Level>) -> Result<EnvFilter> {
    if let Some(level) = level {
        return Ok(EnvFilter::new(level.as_str().to_ascii_lowercase()));
    }
    match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives.trim()).map_err(|e| DriftError::InvalidConfig {
                details: format!("{LOG_ENV}: {e}"),
            })
        }
        _ => Ok(EnvFilter::new("info")),
    }
}

/// Install the global subscriber. Calling it twice is an error, not a panic.
pub fn init(level: Option<tracing::Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .compact();

    tracing_subscriber::registry()
        .with(build_filter(level)?)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| DriftError::Runtime {
            details: format!("logging already initialized: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_levels() {
        assert_eq!(level_from_flags(0, false), None);
        assert_eq!(level_from_flags(1, false), Some(tracing::Level::DEBUG));
        assert_eq!(level_from_flags(3, false), Some(tracing::Level::TRACE));
        assert_eq!(level_from_flags(2, true), Some(tracing::Level::ERROR));
    }

    #[test]
    fn explicit_level_builds_a_filter() {
        let filter = build_filter(Some(tracing::Level::DEBUG)).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn second_init_is_reported() {
        let _ = init(Some(tracing::Level::WARN));
        assert!(init(Some(tracing::Level::WARN)).is_err());
        tracing::warn!("diagnostics initialized");
    }
}
