//! Reliable ingest pipeline.
//!
//! A submission is parsed, compressed and written to the primary store in one
//! attempt. If the write fails, the prepared record is placed on the
//! ingest-retry lane instead, so an accepted submission is never lost. The
//! queue consumer later replays it through [`IngestTask::apply`].

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::model::{AsyncUsageData, Envelope, Locator, TuneRecord, UsageRecord};
use crate::store::{TelemetryStore, WorkQueue};

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Written to the store; the locator points at the new tune.
    Stored(Locator),
    /// Written to the store under the given id; usage reports have no public
    /// locator.
    Recorded(i64),
    /// The store was unavailable; the record waits on the retry lane.
    Deferred,
}

/// A prepared record waiting on the ingest-retry lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestTask {
    /// A tune submission.
    Tune(TuneRecord),
    /// A usage report.
    Usage(UsageRecord),
}

impl IngestTask {
    /// Encode as a retry-lane payload.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a retry-lane payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid task.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Write the record to `store` without any other transformation.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn apply(&self, store: &dyn TelemetryStore) -> Result<i64> {
        match self {
            Self::Tune(tune) => store.put_tune(tune).await,
            Self::Usage(usage) => store.put_usage(usage).await,
        }
    }
}

/// Accepts submissions and guarantees they reach durable storage.
pub struct IngestPipeline {
    store: Arc<dyn TelemetryStore>,
    queue: Arc<dyn WorkQueue>,
    config: IngestConfig,
    rollup_lane: String,
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("config", &self.config)
            .field("rollup_lane", &self.rollup_lane)
            .finish_non_exhaustive()
    }
}

impl IngestPipeline {
    /// Create a pipeline writing to `store` and falling back to `queue`.
    ///
    /// Usage reports are also forwarded to `rollup_lane`.
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        queue: Arc<dyn WorkQueue>,
        config: IngestConfig,
        rollup_lane: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            rollup_lane: rollup_lane.into(),
        }
    }

    /// Ingest a tune document.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedInput`] if the document does not decode.
    /// - [`Error::Queue`] if both the store write and the fallback enqueue fail.
    /// - [`Error::Timeout`] if the configured deadline expires.
    pub async fn ingest_tune(&self, raw: &[u8], envelope: Envelope) -> Result<IngestOutcome> {
        self.with_deadline("tune ingest", self.store_tune(raw, envelope))
            .await
    }

    /// Ingest a usage report and forward it to the rollup lane.
    ///
    /// # Errors
    ///
    /// Same as [`IngestPipeline::ingest_tune`]. A failure to reach the rollup
    /// lane is logged and not reported, since the stored record can be
    /// redriven.
    pub async fn ingest_usage(&self, raw: &[u8], envelope: Envelope) -> Result<IngestOutcome> {
        self.with_deadline("usage ingest", self.store_usage(raw, envelope))
            .await
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.deadline(), fut)
            .await
            .map_err(|_| Error::timeout(operation))?
    }

    async fn store_tune(&self, raw: &[u8], envelope: Envelope) -> Result<IngestOutcome> {
        let record = TuneRecord::from_document(raw, envelope)?;
        info!(
            uuid = %record.uuid,
            board = %record.board,
            raw_bytes = raw.len(),
            compressed_bytes = record.data.len(),
            "Compressed tune"
        );

        let payload = IngestTask::Tune(record.clone()).to_payload()?;

        match self.store.put_tune(&record).await {
            Ok(id) => {
                debug!(id, "Tune stored");
                Ok(IngestOutcome::Stored(Locator::new(
                    &self.config.locator_base_url,
                    id,
                )))
            }
            Err(e) => {
                warn!(error = %e, uuid = %record.uuid, "Tune write failed, deferring to retry lane");
                self.defer(payload).await?;
                Ok(IngestOutcome::Deferred)
            }
        }
    }

    async fn store_usage(&self, raw: &[u8], envelope: Envelope) -> Result<IngestOutcome> {
        let record = UsageRecord::from_document(raw, envelope)?;
        info!(
            raw_bytes = raw.len(),
            compressed_bytes = record.data.len(),
            "Compressed usage report"
        );

        let document = serde_json::from_slice(raw).map_err(|e| Error::malformed(e.to_string()))?;
        let rollup = AsyncUsageData::new(&record.envelope, document).to_payload()?;

        let payload = IngestTask::Usage(record.clone()).to_payload()?;

        let outcome = match self.store.put_usage(&record).await {
            Ok(id) => {
                debug!(id, "Usage report stored");
                IngestOutcome::Recorded(id)
            }
            Err(e) => {
                warn!(error = %e, "Usage write failed, deferring to retry lane");
                self.defer(payload).await?;
                IngestOutcome::Deferred
            }
        };

        if let Err(e) = self.queue.enqueue(&self.rollup_lane, rollup).await {
            warn!(
                error = %e,
                lane = %self.rollup_lane,
                "Could not queue usage report for rollup; redrive will pick it up"
            );
        }

        Ok(outcome)
    }

    async fn defer(&self, payload: Vec<u8>) -> Result<()> {
        let lane = &self.config.retry_lane;
        self.queue
            .enqueue(lane, payload)
            .await
            .map_err(|e| match e {
                Error::Queue { .. } => e,
                other => Error::queue(lane.as_str(), other.to_string()),
            })?;
        info!(lane = %lane, "Record deferred to retry lane");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteQueue, Storage};
    use crate::store::QueueSource;
    use crate::test_support::{FaultyQueue, FlakyStore};
    use std::time::Duration;

    const TUNE: &[u8] = br#"{"uniqueId":"abc","vehicle":{"firmware":{"board":"Sparky2"}},"extra":[1,2,3]}"#;
    const USAGE: &[u8] = br#"{"BoardsSeen":[{"ID":1,"CPU":"cpu-1","Name":"Revolution"}],"ShareIP":"true"}"#;

    fn pipeline(store: Arc<dyn TelemetryStore>, queue: Arc<dyn WorkQueue>) -> IngestPipeline {
        IngestPipeline::new(store, queue, IngestConfig::default(), "asyncRollup")
    }

    #[tokio::test]
    async fn test_ingest_tune_stores_and_returns_locator() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue.clone());

        let outcome = pipeline.ingest_tune(TUNE, Envelope::new("1.2.3.4")).await.unwrap();
        let IngestOutcome::Stored(locator) = outcome else {
            panic!("expected stored outcome, got {outcome:?}");
        };

        assert!(locator.url.ends_with(&format!("/at/tune/{}", locator.id)));
        let stored = store.get_tune(locator.id).await.unwrap().unwrap();
        assert_eq!(stored.document().unwrap(), TUNE);
        assert_eq!(queue.depth("asyncstore").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_tune_malformed_is_not_deferred() {
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(Arc::new(FlakyStore::down()), queue.clone());

        let err = pipeline
            .ingest_tune(b"{not json", Envelope::new(""))
            .await
            .unwrap_err();

        assert!(err.is_client_error());
        assert_eq!(queue.depth("asyncstore").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_tune_defers_when_store_fails() {
        let store = Arc::new(FlakyStore::new(1));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue.clone());

        let outcome = pipeline.ingest_tune(TUNE, Envelope::new("1.2.3.4")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred);

        let messages = queue.lease("asyncstore", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        let IngestTask::Tune(deferred) = IngestTask::from_payload(&messages[0].payload).unwrap()
        else {
            panic!("expected tune task");
        };
        assert_eq!(deferred.document().unwrap(), TUNE);
        assert_eq!(deferred.uuid, "abc");
        assert!(store.inner.recent_tunes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_tune_fails_when_store_and_queue_fail() {
        let pipeline = pipeline(Arc::new(FlakyStore::down()), Arc::new(FaultyQueue::down()));

        let err = pipeline
            .ingest_tune(TUNE, Envelope::new("1.2.3.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Queue { ref lane, .. } if lane == "asyncstore"));
    }

    #[tokio::test]
    async fn test_deferred_tune_applies_identically() {
        let store = Arc::new(FlakyStore::new(1));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue.clone());
        let envelope = Envelope::new("1.2.3.4").with_location("us", "ca", "sf", "1,2");

        pipeline.ingest_tune(TUNE, envelope.clone()).await.unwrap();
        let message = queue.lease("asyncstore", 1).await.unwrap().remove(0);
        let task = IngestTask::from_payload(&message.payload).unwrap();
        let id = task.apply(store.as_ref()).await.unwrap();

        let stored = store.get_tune(id).await.unwrap().unwrap();
        assert_eq!(stored.envelope, envelope);
        assert_eq!(stored.document().unwrap(), TUNE);
    }

    #[tokio::test]
    async fn test_ingest_deadline() {
        let store = Arc::new(FlakyStore::slow(Duration::from_secs(5)));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let config = IngestConfig {
            deadline_ms: 20,
            ..IngestConfig::default()
        };
        let pipeline = IngestPipeline::new(store, queue, config, "asyncRollup");

        let err = pipeline
            .ingest_tune(TUNE, Envelope::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_ingest_usage_records_and_forwards() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue.clone());

        let outcome = pipeline.ingest_usage(USAGE, Envelope::new("5.6.7.8")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Recorded(_)));

        assert_eq!(store.usage_newest_first().await.unwrap().len(), 1);
        let rollup = queue.lease("asyncRollup", 10).await.unwrap();
        assert_eq!(rollup.len(), 1);
        let data = AsyncUsageData::from_payload(&rollup[0].payload).unwrap();
        assert_eq!(data.ip, "5.6.7.8");
        assert_eq!(data.raw_data["BoardsSeen"][0]["CPU"], "cpu-1");
    }

    #[tokio::test]
    async fn test_ingest_usage_defers_and_still_forwards() {
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(Arc::new(FlakyStore::new(1)), queue.clone());

        let outcome = pipeline.ingest_usage(USAGE, Envelope::new("")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred);
        assert_eq!(queue.depth("asyncstore").await.unwrap(), 1);
        assert_eq!(queue.depth("asyncRollup").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_usage_tolerates_rollup_lane_failure() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), Arc::new(FaultyQueue::down()));

        let outcome = pipeline.ingest_usage(USAGE, Envelope::new("")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Recorded(_)));
        assert_eq!(store.usage_newest_first().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_usage_rejects_bad_boards() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store, queue);

        let err = pipeline
            .ingest_usage(br#"{"BoardsSeen":"nope"}"#, Envelope::new(""))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_ingest_tune_with_null_fields() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue);
        let raw = br#"{"uniqueId":null,"vehicle":{"firmware":{"board":"Revo","tag":null}},"identification":{"tau":null}}"#;

        let outcome = pipeline.ingest_tune(raw, Envelope::new("")).await.unwrap();
        let IngestOutcome::Stored(locator) = outcome else {
            panic!("expected stored outcome, got {outcome:?}");
        };
        let stored = store.get_tune(locator.id).await.unwrap().unwrap();
        assert!(stored.uuid.is_empty());
        assert_eq!(stored.board, "Revo");
        assert_eq!(stored.document().unwrap(), raw);
    }

    #[tokio::test]
    async fn test_ingest_usage_with_null_fields_reaches_rollup() {
        use crate::config::RollupConfig;
        use crate::identity::hash_identity;
        use crate::rollup::RollupEngine;
        use crate::store::MemoryStatsCache;

        let store = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let pipeline = pipeline(store.clone(), queue.clone());
        let raw = br#"{"BoardsSeen":[{"ID":1,"UUID":null,"CPU":"c1"}],"CurrentOS":null}"#;

        let outcome = pipeline.ingest_usage(raw, Envelope::new("")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Recorded(_)));

        let message = queue.lease("asyncRollup", 1).await.unwrap().remove(0);
        let data = AsyncUsageData::from_payload(&message.payload).unwrap();
        let engine = RollupEngine::new(
            store.clone(),
            Arc::new(MemoryStatsCache::new()),
            RollupConfig::default(),
        );
        let summary = engine.merge_report(&data).await.unwrap();
        assert_eq!(summary.identities, 1);

        let fc = store.get_controller(&hash_identity("c1")).await.unwrap().unwrap();
        assert!(fc.gcs_os.is_empty());
        assert_eq!(fc.hardware_rev, 1);
    }

    #[test]
    fn test_task_payload_is_tagged() {
        let record = UsageRecord::from_document(b"{}", Envelope::new("")).unwrap();
        let payload = IngestTask::Usage(record).to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["kind"], "usage");
        assert!(value["data"].is_string());
    }
}
