//! Batch dispatcher: re-drives stored usage reports through the rollup lane.
//!
//! Used to rebuild the controller aggregates from history, for example after
//! the merge rules change. Records are packed into fixed-size batches and the
//! batches are enqueued concurrently, with a semaphore bounding how many are
//! in flight.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::RollupConfig;
use crate::error::{Error, Result};
use crate::model::{AsyncUsageData, UsageRecord};
use crate::store::{TelemetryStore, WorkQueue};

/// What one redrive did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedriveSummary {
    /// Records examined.
    pub records: usize,
    /// Records skipped because they could not be decoded.
    pub skipped: usize,
    /// Batches launched.
    pub batches: usize,
    /// Messages enqueued.
    pub enqueued: usize,
}

/// Re-queues historical usage records for rollup.
pub struct Redriver {
    queue: Arc<dyn WorkQueue>,
    config: RollupConfig,
}

impl std::fmt::Debug for Redriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Redriver {
    /// Create a dispatcher enqueuing onto the configured rollup lane.
    pub fn new(queue: Arc<dyn WorkQueue>, config: RollupConfig) -> Self {
        Self { queue, config }
    }

    /// Re-drive every usage record in `store`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, or [`Error::Redrive`] if
    /// any batch could not be enqueued.
    pub async fn redrive_all(&self, store: &dyn TelemetryStore) -> Result<RedriveSummary> {
        let records = store.usage_newest_first().await?;
        self.redrive(records).await
    }

    /// Re-drive the given records.
    ///
    /// Undecodable records are skipped. Every launched batch is awaited
    /// before returning; batches that were enqueued stay enqueued even when
    /// others fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redrive`] if any batch could not be enqueued.
    pub async fn redrive(&self, records: Vec<UsageRecord>) -> Result<RedriveSummary> {
        let batch_size = self.config.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1)));
        let mut in_flight = JoinSet::new();
        let mut summary = RedriveSummary {
            records: records.len(),
            ..RedriveSummary::default()
        };

        let mut batch = Vec::with_capacity(batch_size);
        for record in &records {
            match rollup_payload(record) {
                Ok(payload) => batch.push(payload),
                Err(e) => {
                    summary.skipped += 1;
                    warn!(error = %e, id = ?record.id, "Skipping undecodable usage record");
                    continue;
                }
            }

            if batch.len() == batch_size {
                let payloads = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                self.spawn_batch(&mut in_flight, &semaphore, payloads);
                summary.batches += 1;
            }
        }
        if !batch.is_empty() {
            self.spawn_batch(&mut in_flight, &semaphore, batch);
            summary.batches += 1;
        }

        let mut failed = 0;
        let mut first_error = None;
        while let Some(joined) = in_flight.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(Error::internal(format!("batch task failed: {e}"))));
            match result {
                Ok(count) => summary.enqueued += count,
                Err(e) => {
                    failed += 1;
                    warn!(error = %e, "Redrive batch failed");
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(first_error) = first_error {
            return Err(Error::Redrive {
                failed_batches: failed,
                batches: summary.batches,
                first_error,
            });
        }

        info!(
            records = summary.records,
            skipped = summary.skipped,
            batches = summary.batches,
            enqueued = summary.enqueued,
            lane = %self.config.lane,
            "Queued usage records for rollup"
        );
        Ok(summary)
    }

    fn spawn_batch(
        &self,
        in_flight: &mut JoinSet<Result<usize>>,
        semaphore: &Arc<Semaphore>,
        payloads: Vec<Vec<u8>>,
    ) {
        let queue = Arc::clone(&self.queue);
        let semaphore = Arc::clone(semaphore);
        let lane = self.config.lane.clone();

        in_flight.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| Error::internal(format!("redrive semaphore closed: {e}")))?;
            let count = payloads.len();
            queue.enqueue_batch(&lane, payloads).await?;
            info!(count, lane = %lane, "Added a batch");
            Ok(count)
        });
    }
}

/// Build the rollup-lane payload for a stored usage record.
fn rollup_payload(record: &UsageRecord) -> Result<Vec<u8>> {
    AsyncUsageData::from_record(record)?.to_payload()
}
