//! Configuration management for autotown.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults. The
//! loaded [`Config`] is immutable; each component receives the section it
//! needs at construction time.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "autotown";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "autotown.db";

/// Default work queue file name.
const QUEUE_FILE_NAME: &str = "queue.db";

/// Default crash dump directory name.
const BLOB_DIR_NAME: &str = "blobs";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `AUTOTOWN_`, sections split on `__`)
/// 2. TOML config file at `~/.config/autotown/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Reliable ingest configuration.
    pub ingest: IngestConfig,
    /// Rollup and redrive configuration.
    pub rollup: RollupConfig,
    /// Legacy identity migration configuration.
    pub migration: MigrationConfig,
    /// Queue consumer configuration.
    pub worker: WorkerConfig,
    /// Crash dump configuration.
    pub crash: CrashConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the primary database file.
    /// Defaults to `~/.local/share/autotown/autotown.db`
    pub database_path: Option<PathBuf>,
    /// Path to the durable work queue database file.
    /// Defaults to `~/.local/share/autotown/queue.db`
    pub queue_path: Option<PathBuf>,
}

/// Reliable ingest configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Queue lane used when the synchronous write fails.
    pub retry_lane: String,
    /// Prefix for locators handed back to submitters.
    pub locator_base_url: String,
    /// Deadline for one ingest request, in milliseconds.
    pub deadline_ms: u64,
}

/// Rollup and redrive configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Queue lane carrying usage reports to the merge engine.
    pub lane: String,
    /// Number of messages per redrive batch.
    pub batch_size: usize,
    /// Maximum number of redrive batches enqueued at once.
    pub max_concurrent_batches: usize,
    /// Deadline for one merge, in milliseconds.
    pub deadline_ms: u64,
}

/// Legacy identity migration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Records examined per migration batch.
    pub batch_size: usize,
    /// Identities shorter than this are rewritten.
    pub legacy_identity_threshold: usize,
}

/// Queue consumer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interval between polls of an empty lane, in milliseconds.
    pub poll_interval_ms: u64,
    /// Messages leased per poll.
    pub lease_limit: usize,
    /// Deliveries after which a message is parked instead of redelivered.
    /// Set to 0 for unlimited.
    pub max_attempts: u32,
    /// Seconds a leased message stays hidden before it is redelivered.
    pub visibility_timeout_secs: u64,
}

/// Crash dump configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    /// Directory receiving raw crash dumps.
    /// Defaults to `~/.local/share/autotown/blobs`
    pub blob_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            retry_lane: "asyncstore".to_string(),
            locator_base_url: "https://dronin-autotown.appspot.com/at/tune/".to_string(),
            deadline_ms: 30_000,
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            lane: "asyncRollup".to_string(),
            batch_size: 100,
            max_concurrent_batches: 4,
            deadline_ms: 60_000,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            legacy_identity_threshold: crate::identity::LEGACY_IDENTITY_THRESHOLD,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            lease_limit: 32,
            max_attempts: 0,
            visibility_timeout_secs: 300,
        }
    }
}

impl IngestConfig {
    /// Get the ingest deadline as a Duration.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl RollupConfig {
    /// Get the merge deadline as a Duration.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl WorkerConfig {
    /// Get the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the lease visibility timeout as a Duration.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            // AUTOTOWN_LOG is a log filter, not a setting.
            .merge(Env::prefixed("AUTOTOWN_").ignore(&["log"]).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ingest.deadline_ms", self.ingest.deadline_ms),
            ("rollup.deadline_ms", self.rollup.deadline_ms),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            (
                "worker.visibility_timeout_secs",
                self.worker.visibility_timeout_secs,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        let sizes = [
            ("rollup.batch_size", self.rollup.batch_size),
            (
                "rollup.max_concurrent_batches",
                self.rollup.max_concurrent_batches,
            ),
            ("migration.batch_size", self.migration.batch_size),
            ("worker.lease_limit", self.worker.lease_limit),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        if self.ingest.retry_lane.is_empty() || self.rollup.lane.is_empty() {
            return Err(Error::ConfigValidation {
                message: "queue lane names must not be empty".to_string(),
            });
        }

        if self.ingest.retry_lane == self.rollup.lane {
            return Err(Error::ConfigValidation {
                message: format!(
                    "ingest.retry_lane and rollup.lane must differ (both '{}')",
                    self.rollup.lane
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the work queue path, resolving defaults if not set.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.storage
            .queue_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(QUEUE_FILE_NAME))
    }

    /// Get the crash dump directory, resolving defaults if not set.
    #[must_use]
    pub fn blob_dir(&self) -> PathBuf {
        self.crash
            .blob_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(BLOB_DIR_NAME))
    }
}
