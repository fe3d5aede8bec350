//! `autotown` - Telemetry ingest for flight-controller tune and usage reports
//!
//! This library accepts autotune results and ground station usage reports,
//! guarantees they reach durable storage even when the store is briefly
//! unavailable, and folds usage reports into one aggregate record per
//! physical board.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod codec;
pub mod config;
pub mod crash;
pub mod error;
pub mod export;
pub mod identity;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod redrive;
pub mod rollup;
pub mod stats;
pub mod storage;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use ingest::{IngestOutcome, IngestPipeline};
pub use logging::init_logging;
pub use redrive::Redriver;
pub use rollup::RollupEngine;
pub use storage::{SqliteQueue, Storage, StorageStats};
pub use worker::QueueConsumer;
