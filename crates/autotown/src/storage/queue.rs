//! Durable work queue backed by `SQLite`.
//!
//! Messages live in `queue_messages` until acked. Leasing stamps
//! `leased_until`; a message whose lease lapses becomes deliverable again, so
//! a consumer that dies mid-message causes a redelivery rather than a loss.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::format_timestamp;
use crate::store::{self, QueueMessage, QueueSource, WorkQueue};

use super::{blocking, limit_param, migrations, open_connection, parse_timestamp};

/// Default time a leased message stays hidden.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// `SQLite`-backed [`WorkQueue`] and [`QueueSource`].
///
/// Like [`super::Storage`], clones share one connection and the async
/// methods run on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl SqliteQueue {
    /// Open or create a queue database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        migrations::initialize_queue_schema(&conn)?;

        info!("Work queue opened at {}", path.display());
        Ok(Self::from_connection(path, conn))
    }

    /// Create an in-memory queue for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;
        migrations::initialize_queue_schema(&conn)?;
        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_attempts: 0,
        }
    }

    /// Set how long a leased message stays hidden from other consumers.
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Park messages after this many deliveries. Zero means never.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Get the path to the queue database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        store::lock(&*self.conn, "queue")
    }

    fn insert(&self, lane: &str, payloads: &[Vec<u8>]) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO queue_messages (lane, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            )?;
            for payload in payloads {
                stmt.execute(params![lane, payload, now])?;
            }
        }
        tx.commit()?;
        debug!(lane, count = payloads.len(), "Enqueued messages");
        Ok(())
    }

    fn take_leases(&self, lane: &str, limit: usize) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let lease_for = chrono::Duration::from_std(self.visibility_timeout)
            .map_err(|e| Error::internal(format!("visibility timeout out of range: {e}")))?;
        let leased_until = format_timestamp(&(now + lease_for));
        let now = format_timestamp(&now);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut messages = {
            let mut stmt = tx.prepare(
                r"
                SELECT id, lane, payload, attempts, enqueued_at FROM queue_messages
                WHERE lane = ?1 AND parked = 0
                  AND (leased_until IS NULL OR leased_until <= ?2)
                ORDER BY id
                LIMIT ?3
                ",
            )?;
            let rows = stmt.query_map(params![lane, now, limit_param(limit)], |row| {
                Ok(QueueMessage {
                    id: row.get(0)?,
                    lane: row.get(1)?,
                    payload: row.get(2)?,
                    attempts: row.get(3)?,
                    enqueued_at: parse_timestamp(4, &row.get::<_, String>(4)?)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for message in &mut messages {
            tx.execute(
                "UPDATE queue_messages SET attempts = attempts + 1, leased_until = ?1 WHERE id = ?2",
                params![leased_until, message.id],
            )?;
            message.attempts += 1;
        }
        tx.commit()?;

        Ok(messages)
    }

    fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM queue_messages WHERE id = ?1", [id])?;
        Ok(())
    }

    fn return_lease(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        let attempts: Option<u32> = conn
            .query_row(
                "SELECT attempts FROM queue_messages WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(Error::NotFound(format!("queue message {id}")));
        };

        let park = self.max_attempts > 0 && attempts >= self.max_attempts;
        conn.execute(
            "UPDATE queue_messages SET leased_until = NULL, last_error = ?1, parked = ?2 WHERE id = ?3",
            params![reason, park, id],
        )?;

        if park {
            warn!(id, attempts, reason, "Message parked after repeated failures");
        } else {
            debug!(id, attempts, reason, "Message released for redelivery");
        }
        Ok(())
    }

    fn count(&self, lane: &str, parked: bool) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE lane = ?1 AND parked = ?2",
            params![lane, parked],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Number of messages on `lane` that were parked after too many failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn parked(&self, lane: &str) -> Result<usize> {
        self.count(lane, true)
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, lane: &str, payload: Vec<u8>) -> Result<()> {
        self.enqueue_batch(lane, vec![payload]).await
    }

    async fn enqueue_batch(&self, lane: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        let owned = lane.to_string();
        blocking(self, move |q| q.insert(&owned, &payloads))
            .await
            .map_err(|e| Error::queue(lane, e.to_string()))
    }
}

#[async_trait]
impl QueueSource for SqliteQueue {
    async fn lease(&self, lane: &str, limit: usize) -> Result<Vec<QueueMessage>> {
        let owned = lane.to_string();
        blocking(self, move |q| q.take_leases(&owned, limit))
            .await
            .map_err(|e| Error::queue(lane, e.to_string()))
    }

    async fn ack(&self, id: i64) -> Result<()> {
        blocking(self, move |q| q.delete(id)).await
    }

    async fn release(&self, id: i64, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        blocking(self, move |q| q.return_lease(id, &reason)).await
    }

    async fn depth(&self, lane: &str) -> Result<usize> {
        let lane = lane.to_string();
        blocking(self, move |q| q.count(&lane, false)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_queue() -> SqliteQueue {
        SqliteQueue::open_in_memory().expect("failed to create test queue")
    }

    #[tokio::test]
    async fn test_enqueue_and_lease_in_order() {
        let queue = create_test_queue();
        queue.enqueue("a", b"one".to_vec()).await.unwrap();
        queue
            .enqueue_batch("a", vec![b"two".to_vec(), b"three".to_vec()])
            .await
            .unwrap();
        queue.enqueue("b", b"other".to_vec()).await.unwrap();

        assert_eq!(queue.depth("a").await.unwrap(), 3);
        assert_eq!(queue.depth("b").await.unwrap(), 1);

        let leased = queue.lease("a", 10).await.unwrap();
        let payloads: Vec<_> = leased.iter().map(|m| m.payload.as_slice()).collect();
        assert_eq!(payloads, [&b"one"[..], b"two", b"three"]);
        assert!(leased.iter().all(|m| m.attempts == 1 && m.lane == "a"));
    }

    #[tokio::test]
    async fn test_leased_messages_hidden() {
        let queue = create_test_queue();
        queue.enqueue("a", b"x".to_vec()).await.unwrap();

        assert_eq!(queue.lease("a", 10).await.unwrap().len(), 1);
        assert!(queue.lease("a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = create_test_queue();
        queue.enqueue("a", b"x".to_vec()).await.unwrap();

        let leased = queue.lease("a", 1).await.unwrap();
        queue.ack(leased[0].id).await.unwrap();

        assert_eq!(queue.depth("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_redelivers() {
        let queue = create_test_queue();
        queue.enqueue("a", b"x".to_vec()).await.unwrap();

        let first = queue.lease("a", 1).await.unwrap();
        queue.release(first[0].id, "store down").await.unwrap();

        let second = queue.lease("a", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let queue = create_test_queue().with_visibility_timeout(Duration::ZERO);
        queue.enqueue("a", b"x".to_vec()).await.unwrap();

        let first = queue.lease("a", 1).await.unwrap();
        let second = queue.lease("a", 1).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn test_max_attempts_parks_message() {
        let queue = create_test_queue().with_max_attempts(2);
        queue.enqueue("a", b"poison".to_vec()).await.unwrap();

        for _ in 0..2 {
            let leased = queue.lease("a", 1).await.unwrap();
            queue.release(leased[0].id, "bad payload").await.unwrap();
        }

        assert!(queue.lease("a", 1).await.unwrap().is_empty());
        assert_eq!(queue.depth("a").await.unwrap(), 0);
        assert_eq!(queue.parked("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_unknown_message() {
        let queue = create_test_queue();
        let err = queue.release(42, "gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_clones_share_messages() {
        let queue = create_test_queue();
        let producer = queue.clone();
        producer.enqueue("a", b"x".to_vec()).await.unwrap();

        let leased = queue.lease("a", 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert!(producer.lease("a", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_deadline_while_busy() {
        let queue = create_test_queue();
        let busy = queue.conn().unwrap();

        let enqueue = tokio::time::timeout(
            Duration::from_millis(50),
            queue.enqueue("a", b"late".to_vec()),
        )
        .await;
        assert!(enqueue.is_err());
        drop(busy);

        for _ in 0..200 {
            if queue.depth("a").await.unwrap() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("abandoned enqueue never completed");
    }

    #[tokio::test]
    async fn test_open_file_queue() {
        let path = std::env::temp_dir().join(format!("autotown_queue_test_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let queue = SqliteQueue::open(&path).unwrap();
            queue.enqueue("a", b"durable".to_vec()).await.unwrap();
        }

        let reopened = SqliteQueue::open(&path).unwrap();
        assert_eq!(reopened.depth("a").await.unwrap(), 1);
        assert_eq!(reopened.path(), path);

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
