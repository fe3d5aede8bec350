//! Fault-injecting store and queue wrappers shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{CrashRecord, FoundController, TuneRecord, UsageRecord};
use crate::storage::{SqliteQueue, Storage};
use crate::store::{ControllerUpdate, QueueMessage, QueueSource, TelemetryStore, WorkQueue};

/// Store whose writes fail a fixed number of times before reaching `inner`.
#[derive(Debug)]
pub struct FlakyStore {
    pub inner: Storage,
    failures: AtomicUsize,
    delay: Duration,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: Storage::open_in_memory().unwrap(),
            failures: AtomicUsize::new(failures),
            delay: Duration::ZERO,
        }
    }

    pub fn down() -> Self {
        Self::new(usize::MAX)
    }

    /// Delay every write by `delay` before deciding whether it fails.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(0)
        }
    }

    async fn check(&self) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(Error::store_unavailable("injected store failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TelemetryStore for FlakyStore {
    async fn put_tune(&self, tune: &TuneRecord) -> Result<i64> {
        self.check().await?;
        self.inner.put_tune(tune).await
    }

    async fn get_tune(&self, id: i64) -> Result<Option<TuneRecord>> {
        self.inner.get_tune(id).await
    }

    async fn recent_tunes(&self, limit: usize) -> Result<Vec<TuneRecord>> {
        self.inner.recent_tunes(limit).await
    }

    async fn tunes_oldest_first(&self) -> Result<Vec<TuneRecord>> {
        self.inner.tunes_oldest_first().await
    }

    async fn legacy_tunes(
        &self,
        threshold: usize,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TuneRecord>> {
        self.inner.legacy_tunes(threshold, before, limit).await
    }

    async fn update_tunes(&self, tunes: &[TuneRecord]) -> Result<usize> {
        self.check().await?;
        self.inner.update_tunes(tunes).await
    }

    async fn put_usage(&self, usage: &UsageRecord) -> Result<i64> {
        self.check().await?;
        self.inner.put_usage(usage).await
    }

    async fn usage_newest_first(&self) -> Result<Vec<UsageRecord>> {
        self.inner.usage_newest_first().await
    }

    async fn get_controller(&self, uuid: &str) -> Result<Option<FoundController>> {
        self.inner.get_controller(uuid).await
    }

    async fn controllers_newest_first(&self) -> Result<Vec<FoundController>> {
        self.inner.controllers_newest_first().await
    }

    async fn update_controllers(
        &self,
        uuids: &[String],
        update: Arc<ControllerUpdate>,
    ) -> Result<usize> {
        self.check().await?;
        self.inner.update_controllers(uuids, update).await
    }

    async fn put_crash(&self, crash: &CrashRecord) -> Result<i64> {
        self.check().await?;
        self.inner.put_crash(crash).await
    }

    async fn recent_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>> {
        self.inner.recent_crashes(limit).await
    }
}

type FailWhen = Box<dyn Fn(usize, usize) -> bool + Send + Sync>;

/// Queue that rejects enqueues matching a predicate over
/// `(call index, payload count)` and forwards the rest to `inner`.
pub struct FaultyQueue {
    pub inner: SqliteQueue,
    calls: AtomicUsize,
    fail_when: FailWhen,
}

impl std::fmt::Debug for FaultyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyQueue")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

impl FaultyQueue {
    pub fn new(fail_when: impl Fn(usize, usize) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: SqliteQueue::open_in_memory().unwrap(),
            calls: AtomicUsize::new(0),
            fail_when: Box::new(fail_when),
        }
    }

    pub fn down() -> Self {
        Self::new(|_, _| true)
    }

    fn check(&self, lane: &str, count: usize) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if (self.fail_when)(call, count) {
            Err(Error::queue(lane, "injected queue failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkQueue for FaultyQueue {
    async fn enqueue(&self, lane: &str, payload: Vec<u8>) -> Result<()> {
        self.check(lane, 1)?;
        self.inner.enqueue(lane, payload).await
    }

    async fn enqueue_batch(&self, lane: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        self.check(lane, payloads.len())?;
        self.inner.enqueue_batch(lane, payloads).await
    }
}

#[async_trait]
impl QueueSource for FaultyQueue {
    async fn lease(&self, lane: &str, limit: usize) -> Result<Vec<QueueMessage>> {
        self.inner.lease(lane, limit).await
    }

    async fn ack(&self, id: i64) -> Result<()> {
        self.inner.ack(id).await
    }

    async fn release(&self, id: i64, reason: &str) -> Result<()> {
        self.inner.release(id, reason).await
    }

    async fn depth(&self, lane: &str) -> Result<usize> {
        self.inner.depth(lane).await
    }
}
