//! Boundaries between the core and its backing services.
//!
//! The ingest pipeline, merge engine and dispatcher only see these traits.
//! [`crate::storage::Storage`] and [`crate::storage::SqliteQueue`] are the
//! bundled implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{CrashRecord, FoundController, TuneRecord, UsageRecord};

/// Read-modify-write step applied to one controller inside a transaction.
///
/// Receives the identity and the stored record, if any, and returns the
/// record to write back. An error aborts the whole transaction. Stores may
/// run it on a blocking thread, so it owns everything it reads.
pub type ControllerUpdate =
    dyn Fn(&str, Option<FoundController>) -> Result<FoundController> + Send + Sync;

/// Durable record store.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persist a tune, returning its id. Writing the same record twice yields
    /// the same id and a single row.
    async fn put_tune(&self, tune: &TuneRecord) -> Result<i64>;

    /// Fetch a tune by id.
    async fn get_tune(&self, id: i64) -> Result<Option<TuneRecord>>;

    /// Most recent tunes, newest first.
    async fn recent_tunes(&self, limit: usize) -> Result<Vec<TuneRecord>>;

    /// Every tune, oldest first.
    async fn tunes_oldest_first(&self) -> Result<Vec<TuneRecord>>;

    /// Tunes whose identity is shorter than `threshold` bytes, highest id
    /// first, starting below `before` when given.
    async fn legacy_tunes(
        &self,
        threshold: usize,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TuneRecord>>;

    /// Overwrite existing tunes by id in one transaction.
    async fn update_tunes(&self, tunes: &[TuneRecord]) -> Result<usize>;

    /// Persist a usage report, returning its id.
    async fn put_usage(&self, usage: &UsageRecord) -> Result<i64>;

    /// Every usage report, newest first.
    async fn usage_newest_first(&self) -> Result<Vec<UsageRecord>>;

    /// Fetch one controller aggregate.
    async fn get_controller(&self, uuid: &str) -> Result<Option<FoundController>>;

    /// Every controller aggregate, most recently seen first.
    async fn controllers_newest_first(&self) -> Result<Vec<FoundController>>;

    /// Apply `update` to every identity in `uuids` inside one transaction.
    ///
    /// Either every record is written or none is. Returns the number of
    /// identities that had no stored record.
    async fn update_controllers(
        &self,
        uuids: &[String],
        update: Arc<ControllerUpdate>,
    ) -> Result<usize>;

    /// Persist a crash report, returning its id.
    async fn put_crash(&self, crash: &CrashRecord) -> Result<i64>;

    /// Most recent crash reports, newest first.
    async fn recent_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>>;
}

/// Producer side of the durable work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append one message to `lane`.
    async fn enqueue(&self, lane: &str, payload: Vec<u8>) -> Result<()>;

    /// Append several messages to `lane`; all or none are enqueued.
    async fn enqueue_batch(&self, lane: &str, payloads: Vec<Vec<u8>>) -> Result<()>;
}

/// A message leased from a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned id.
    pub id: i64,
    /// Lane the message belongs to.
    pub lane: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    /// When the message was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Consumer side of the durable work queue.
///
/// A leased message is hidden from other consumers until it is acked or
/// released, or until its lease expires, giving at-least-once delivery.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Lease up to `limit` messages from `lane`.
    async fn lease(&self, lane: &str, limit: usize) -> Result<Vec<QueueMessage>>;

    /// Remove a processed message.
    async fn ack(&self, id: i64) -> Result<()>;

    /// Return a message for redelivery, recording why it failed.
    async fn release(&self, id: i64, reason: &str) -> Result<()>;

    /// Number of deliverable messages on `lane`.
    async fn depth(&self, lane: &str) -> Result<usize>;
}

/// Best-effort cache for precomputed snapshots.
///
/// Callers must treat every failure as a miss.
#[async_trait]
pub trait StatsCache: Send + Sync {
    /// Fetch a cached value.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a value.
    async fn put(&self, key: &str, value: Vec<u8>);

    /// Drop a value.
    async fn invalidate(&self, key: &str);
}

/// In-process [`StatsCache`].
#[derive(Debug, Default)]
pub struct MemoryStatsCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStatsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T) -> Option<T> {
        match self.entries.lock() {
            Ok(mut entries) => Some(f(&mut entries)),
            Err(_) => {
                tracing::warn!("stats cache lock poisoned; treating as miss");
                None
            }
        }
    }
}

#[async_trait]
impl StatsCache for MemoryStatsCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.with_entries(|entries| entries.get(key).cloned())
            .flatten()
    }

    async fn put(&self, key: &str, value: Vec<u8>) {
        self.with_entries(|entries| entries.insert(key.to_string(), value));
    }

    async fn invalidate(&self, key: &str) {
        self.with_entries(|entries| entries.remove(key));
    }
}

/// Lock a mutex-guarded connection, mapping poisoning to an internal error.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::internal(format!("{what} lock poisoned")))
}
