//! Error types for autotown.
//!
//! This module defines all error types used throughout the autotown crate.
//! The first group of variants is the ingest/rollup taxonomy that decides
//! whether a failure is the client's fault, is skipped locally, or is handed
//! back to the queue for redelivery.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for autotown operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Ingest / Rollup Taxonomy ===
    /// The submitted document could not be parsed. Never retried.
    #[error("malformed input: {message}")]
    MalformedInput {
        /// Description of what was wrong with the document.
        message: String,
    },

    /// A board sighting carried neither a unique ID nor a CPU ID.
    #[error("no identity: sighting has neither a unique id nor a hardware id")]
    NoIdentity,

    /// Compression or decompression failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The primary store rejected or could not accept a write.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The durable work queue could not accept or serve a message.
    #[error("queue error on lane '{lane}': {message}")]
    Queue {
        /// The lane the operation targeted.
        lane: String,
        /// Description of what went wrong.
        message: String,
    },

    /// One or more redrive batches could not be enqueued.
    #[error("redrive incomplete: {failed_batches} of {batches} batches failed: {first_error}")]
    Redrive {
        /// Number of batches that failed.
        failed_batches: usize,
        /// Number of batches attempted.
        batches: usize,
        /// The first error observed.
        first_error: String,
    },

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for autotown operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a malformed input error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    /// Create a codec error.
    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Create a store unavailable error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Create a queue error for the given lane.
    #[must_use]
    pub fn queue(lane: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Queue {
            lane: lane.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error was caused by the submitting client.
    ///
    /// Client errors are reported back immediately and never retried.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }

    /// Check if this error is transient and worth handing to a retry path.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::DatabaseQuery(_)
                | Self::Queue { .. }
                | Self::Timeout { .. }
                | Self::Redrive { .. }
        )
    }
}
