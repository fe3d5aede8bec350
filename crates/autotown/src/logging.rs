//! Logging configuration for autotown.
//!
//! This module provides initialization and configuration for the tracing-based
//! logging system used throughout autotown.
//!
//! The store logs one line per row it touches, while the ingest pipeline and
//! queue consumer log one line per submission or message. The default filters
//! keep the store one level quieter than the rest so that a `drain --follow`
//! at normal verbosity reads as a record of submissions, not of SQL.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding a filter for this service only.
///
/// Checked before `RUST_LOG`, so the two can differ in a shared environment.
pub const LOG_ENV: &str = "AUTOTOWN_LOG";

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Suppress all output except errors.
    Quiet,
    /// Normal output level (info and above).
    #[default]
    Normal,
    /// Verbose output (debug and above).
    Verbose,
    /// Very verbose output (trace level).
    Trace,
}

impl Verbosity {
    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Default filter directives for this verbosity.
    #[must_use]
    pub fn directives(&self) -> String {
        let level = self.to_level_filter();
        let storage = match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::INFO,
            Self::Trace => Level::TRACE,
        };
        format!(
            "autotown={level},autotown::ingest={level},autotown::worker={level},\
             autotown::storage={storage}"
        )
    }
}

/// Initialize the logging system.
///
/// This should be called once at application startup. A filter in
/// [`LOG_ENV`] wins, then `RUST_LOG`, then [`Verbosity::directives`]. Logs go
/// to stderr so exports written to stdout stay clean.
///
/// # Examples
///
/// ```no_run
/// use autotown::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directives()));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        );

    // Ignore the error if a subscriber is already installed.
    let _ = subscriber.try_init();
}

/// Initialize logging for tests.
///
/// Only warnings and errors are shown to keep test output clean.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
