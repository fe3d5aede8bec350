//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::model::Envelope;

/// Submission metadata given on the command line.
#[derive(Debug, Clone, Default, Args)]
pub struct EnvelopeArgs {
    /// Network address of the submitter
    #[arg(long, default_value = "")]
    pub addr: String,

    /// Country code of the submitter
    #[arg(long, default_value = "")]
    pub country: String,

    /// Region of the submitter
    #[arg(long, default_value = "")]
    pub region: String,

    /// City of the submitter
    #[arg(long, default_value = "")]
    pub city: String,

    /// Location as "<lat>,<lon>"
    #[arg(long, value_name = "LAT,LON", default_value = "")]
    pub lat_lon: String,
}

impl EnvelopeArgs {
    /// Build an envelope stamped with the current time.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.addr.clone()).with_location(
            self.country.clone(),
            self.region.clone(),
            self.city.clone(),
            &self.lat_lon,
        )
    }
}

/// Submit a document read from a file ("-" for stdin).
#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Document to submit
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Submission metadata
    #[command(flatten)]
    pub envelope: EnvelopeArgs,
}

/// Ingest commands.
#[derive(Debug, Subcommand)]
pub enum IngestCommand {
    /// Submit an autotune result
    Tune(SubmitArgs),

    /// Submit a ground station usage report
    Usage(SubmitArgs),
}

/// Queue drain arguments.
#[derive(Debug, Args)]
pub struct DrainCommand {
    /// Keep polling until interrupted
    #[arg(short, long)]
    pub follow: bool,
}

/// Identity migration arguments.
#[derive(Debug, Args)]
pub struct MigrateCommand {
    /// Run batches until nothing is left to rewrite
    #[arg(short, long)]
    pub all: bool,
}

/// Export commands.
#[derive(Debug, Subcommand)]
pub enum ExportCommand {
    /// Export every tune
    Tunes {
        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: TuneFormat,

        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Export every board aggregate as CSV
    Boards {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List the most recent tunes
    RecentTunes {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show one tune
    Tune {
        /// Tune locator URL or id
        locator: String,
    },

    /// List the most recent crash reports
    Crashes {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

/// Statistics arguments.
#[derive(Debug, Args)]
pub struct StatsCommand {
    /// Recompute instead of reading the cached snapshot
    #[arg(short, long)]
    pub refresh: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Tune export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TuneFormat {
    /// Flattened CSV with anonymized ids
    #[default]
    Csv,
    /// One JSON object per line
    Json,
}
