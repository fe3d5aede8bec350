//! Command-line interface for autotown.
//!
//! This module provides the CLI structure for the `autotown` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, DrainCommand, EnvelopeArgs, ExportCommand, IngestCommand, MigrateCommand,
    StatsCommand, StatusCommand, SubmitArgs, TuneFormat,
};

/// autotown - Telemetry ingest for flight-controller tunes and usage reports
///
/// Stores autotune results, usage reports and crash dumps, folds usage
/// reports into per-board aggregates, and exports anonymized datasets.
#[derive(Debug, Parser)]
#[command(name = "autotown")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a tune or usage report
    #[command(subcommand)]
    Ingest(IngestCommand),

    /// Submit a crash report
    Crash(SubmitArgs),

    /// Process deferred writes and pending rollups
    Drain(DrainCommand),

    /// Queue every stored usage report for rollup again
    Redrive,

    /// Rewrite legacy board identities on stored tunes
    MigrateIds(MigrateCommand),

    /// Export stored data
    #[command(subcommand)]
    Export(ExportCommand),

    /// Show rollup statistics
    Stats(StatsCommand),

    /// Show store and queue status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
