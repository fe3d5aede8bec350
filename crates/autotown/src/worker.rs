//! Queue consumer.
//!
//! Drains the ingest-retry lane (decode, then write) and the rollup lane
//! (decode, then merge). A message is acked only after its work succeeded.
//! Failures that [`Error::is_retryable`] accepts release it for redelivery;
//! anything else is logged and dropped.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::ingest::IngestTask;
use crate::model::AsyncUsageData;
use crate::rollup::RollupEngine;
use crate::store::{QueueMessage, QueueSource, TelemetryStore};

/// Counts from draining one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Messages processed and acked.
    pub processed: usize,
    /// Messages released for redelivery.
    pub released: usize,
    /// Messages dropped as unprocessable.
    pub dropped: usize,
}

impl DrainSummary {
    fn absorb(&mut self, other: Self) {
        self.processed += other.processed;
        self.released += other.released;
        self.dropped += other.dropped;
    }
}

enum Handled {
    Done,
    Released,
    Dropped,
}

/// Consumes the ingest-retry and rollup lanes.
pub struct QueueConsumer {
    queue: Arc<dyn QueueSource>,
    store: Arc<dyn TelemetryStore>,
    engine: RollupEngine,
    ingest_lane: String,
    rollup_lane: String,
    config: WorkerConfig,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("ingest_lane", &self.ingest_lane)
            .field("rollup_lane", &self.rollup_lane)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    /// Create a consumer.
    pub fn new(
        queue: Arc<dyn QueueSource>,
        store: Arc<dyn TelemetryStore>,
        engine: RollupEngine,
        ingest_lane: impl Into<String>,
        rollup_lane: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            engine,
            ingest_lane: ingest_lane.into(),
            rollup_lane: rollup_lane.into(),
            config,
        }
    }

    /// Drain both lanes once, ingest lane first.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue itself fails.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = self.drain_lane(&self.ingest_lane).await?;
        summary.absorb(self.drain_lane(&self.rollup_lane).await?);
        Ok(summary)
    }

    /// Process messages on `lane` until it is empty or a whole lease fails.
    ///
    /// # Errors
    ///
    /// Returns an error if leasing, acking or releasing fails.
    pub async fn drain_lane(&self, lane: &str) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        loop {
            let messages = self.queue.lease(lane, self.config.lease_limit).await?;
            if messages.is_empty() {
                break;
            }

            let mut progressed = false;
            for message in messages {
                match self.handle(lane, &message).await? {
                    Handled::Done => {
                        summary.processed += 1;
                        progressed = true;
                    }
                    Handled::Dropped => {
                        summary.dropped += 1;
                        progressed = true;
                    }
                    Handled::Released => summary.released += 1,
                }
            }

            if !progressed {
                debug!(lane, "No progress on lane, backing off");
                break;
            }
        }

        if summary != DrainSummary::default() {
            info!(
                lane,
                processed = summary.processed,
                released = summary.released,
                dropped = summary.dropped,
                "Drained lane"
            );
        }
        Ok(summary)
    }

    /// Drain both lanes repeatedly until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue itself fails.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(
            ingest_lane = %self.ingest_lane,
            rollup_lane = %self.rollup_lane,
            "Queue consumer started"
        );

        loop {
            self.drain().await?;
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!("Queue consumer stopped");
        Ok(())
    }

    async fn handle(&self, lane: &str, message: &QueueMessage) -> Result<Handled> {
        match self.process(lane, message).await {
            Ok(()) => {
                self.queue.ack(message.id).await?;
                Ok(Handled::Done)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    id = message.id,
                    attempts = message.attempts,
                    lane,
                    "Message failed, releasing for redelivery"
                );
                self.queue.release(message.id, &e.to_string()).await?;
                Ok(Handled::Released)
            }
            Err(e) => {
                error!(
                    error = %e,
                    id = message.id,
                    lane,
                    client = e.is_client_error(),
                    "Dropping message that can never be processed"
                );
                self.queue.ack(message.id).await?;
                Ok(Handled::Dropped)
            }
        }
    }

    async fn process(&self, lane: &str, message: &QueueMessage) -> Result<()> {
        if lane == self.ingest_lane {
            let task = IngestTask::from_payload(&message.payload)?;
            let id = task.apply(self.store.as_ref()).await?;
            debug!(id, "Deferred record written");
            Ok(())
        } else if lane == self.rollup_lane {
            let data = AsyncUsageData::from_payload(&message.payload)?;
            self.engine.merge_report(&data).await?;
            Ok(())
        } else {
            Err(Error::internal(format!("no handler for lane '{lane}'")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, RollupConfig};
    use crate::ingest::{IngestOutcome, IngestPipeline};
    use crate::model::Envelope;
    use crate::storage::SqliteQueue;
    use crate::store::{MemoryStatsCache, WorkQueue};
    use crate::test_support::FlakyStore;
    use std::time::Duration;

    const TUNE: &[u8] = br#"{"uniqueId":"abc","vehicle":{"firmware":{"board":"Revo"}}}"#;

    struct Fixture {
        store: Arc<FlakyStore>,
        queue: Arc<SqliteQueue>,
        pipeline: IngestPipeline,
        consumer: QueueConsumer,
    }

    fn fixture(store_failures: usize) -> Fixture {
        let store = Arc::new(FlakyStore::new(store_failures));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let ingest = IngestConfig::default();
        let rollup = RollupConfig::default();

        let pipeline = IngestPipeline::new(
            store.clone(),
            queue.clone(),
            ingest.clone(),
            rollup.lane.clone(),
        );
        let engine = RollupEngine::new(
            store.clone(),
            Arc::new(MemoryStatsCache::new()),
            rollup.clone(),
        );
        let consumer = QueueConsumer::new(
            queue.clone(),
            store.clone(),
            engine,
            ingest.retry_lane,
            rollup.lane,
            WorkerConfig::default(),
        );

        Fixture {
            store,
            queue,
            pipeline,
            consumer,
        }
    }

    #[tokio::test]
    async fn test_deferred_tune_is_persisted_exactly_once() {
        let f = fixture(1);

        let outcome = f.pipeline.ingest_tune(TUNE, Envelope::new("1.1.1.1")).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Deferred);

        let summary = f.consumer.drain().await.unwrap();
        assert_eq!(summary.processed, 1);

        let tunes = f.store.recent_tunes(10).await.unwrap();
        assert_eq!(tunes.len(), 1);
        assert_eq!(tunes[0].document().unwrap(), TUNE);

        assert_eq!(f.consumer.drain().await.unwrap(), DrainSummary::default());
        assert_eq!(f.store.recent_tunes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_redelivered() {
        // Fails on ingest and again on the first replay.
        let f = fixture(2);
        f.pipeline.ingest_tune(TUNE, Envelope::new("")).await.unwrap();

        let first = f.consumer.drain_lane("asyncstore").await.unwrap();
        assert_eq!(first.released, 1);
        assert_eq!(f.queue.depth("asyncstore").await.unwrap(), 1);

        let second = f.consumer.drain_lane("asyncstore").await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(f.queue.depth("asyncstore").await.unwrap(), 0);
        assert_eq!(f.store.recent_tunes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_does_not_duplicate() {
        let store = Arc::new(FlakyStore::new(1));
        let queue = Arc::new(
            SqliteQueue::open_in_memory()
                .unwrap()
                .with_visibility_timeout(Duration::ZERO),
        );
        let pipeline = IngestPipeline::new(
            store.clone(),
            queue.clone(),
            IngestConfig::default(),
            "asyncRollup",
        );
        pipeline.ingest_tune(TUNE, Envelope::new("")).await.unwrap();

        // A consumer that crashed after writing but before acking.
        let leased = queue.lease("asyncstore", 1).await.unwrap();
        let task = IngestTask::from_payload(&leased[0].payload).unwrap();
        task.apply(store.as_ref()).await.unwrap();

        let consumer = QueueConsumer::new(
            queue.clone(),
            store.clone(),
            RollupEngine::new(
                store.clone(),
                Arc::new(MemoryStatsCache::new()),
                RollupConfig::default(),
            ),
            "asyncstore",
            "asyncRollup",
            WorkerConfig::default(),
        );
        let summary = consumer.drain().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(store.recent_tunes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_usage_flows_through_rollup_lane() {
        let f = fixture(0);
        let usage = br#"{"BoardsSeen":[{"ID":259,"UUID":"board-9","Name":"RevoMini"}]}"#;

        f.pipeline.ingest_usage(usage, Envelope::new("")).await.unwrap();
        let summary = f.consumer.drain().await.unwrap();

        assert_eq!(summary.processed, 1);
        let fc = f.store.get_controller("board-9").await.unwrap().unwrap();
        assert_eq!(fc.name, "Revo");
        assert_eq!(fc.hardware_rev, 3);
    }

    #[tokio::test]
    async fn test_unprocessable_message_is_dropped() {
        let f = fixture(0);
        f.queue.enqueue("asyncRollup", b"garbage".to_vec()).await.unwrap();
        f.queue.enqueue("asyncstore", b"{}".to_vec()).await.unwrap();

        let summary = f.consumer.drain().await.unwrap();

        assert_eq!(summary.dropped, 2);
        assert_eq!(f.queue.depth("asyncRollup").await.unwrap(), 0);
        assert_eq!(f.queue.depth("asyncstore").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_merge_is_released() {
        let store = Arc::new(FlakyStore::slow(Duration::from_secs(5)));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let rollup = RollupConfig {
            deadline_ms: 20,
            ..RollupConfig::default()
        };
        let engine = RollupEngine::new(store.clone(), Arc::new(MemoryStatsCache::new()), rollup);
        let consumer = QueueConsumer::new(
            queue.clone(),
            store.clone(),
            engine,
            "asyncstore",
            "asyncRollup",
            WorkerConfig::default(),
        );
        let doc = serde_json::json!({"BoardsSeen": [{"UUID": "board-1"}]});
        let payload = AsyncUsageData::new(&Envelope::new(""), doc).to_payload().unwrap();
        queue.enqueue("asyncRollup", payload).await.unwrap();

        let summary = consumer.drain_lane("asyncRollup").await.unwrap();
        assert_eq!(summary.released, 1);
        assert_eq!(summary.dropped, 0);
        assert_eq!(queue.depth("asyncRollup").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_lane_is_dropped() {
        let f = fixture(0);
        f.queue.enqueue("elsewhere", b"{}".to_vec()).await.unwrap();

        let summary = f.consumer.drain_lane("elsewhere").await.unwrap();
        assert_eq!(summary.dropped, 1);
        assert_eq!(f.queue.depth("elsewhere").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(1);
        f.pipeline.ingest_tune(TUNE, Envelope::new("")).await.unwrap();

        f.consumer.run(async {}).await.unwrap();
        assert_eq!(f.store.recent_tunes(10).await.unwrap().len(), 1);
    }
}
