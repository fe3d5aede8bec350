//! Storage layer for autotown.
//!
//! This module provides `SQLite`-based persistent storage for tunes, usage
//! reports, crash reports and controller aggregates, plus the `SQLite`-backed
//! durable work queue.

pub mod migrations;
pub mod queue;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{format_timestamp, CrashRecord, Envelope, FoundController, TuneRecord, UsageRecord};
use crate::store::{self, ControllerUpdate, TelemetryStore};

pub use queue::SqliteQueue;

const TUNE_COLUMNS: &str =
    "id, timestamp, uuid, board, tau, addr, country, region, city, lat, lon, data";

const USAGE_COLUMNS: &str = "id, timestamp, addr, country, region, city, lat, lon, data";

const CONTROLLER_COLUMNS: &str = "uuid, name, hardware_rev, git_hash, git_tag, uavo_hash, \
     gcs_os, gcs_arch, gcs_version, addr, country, region, city, lat, lon, \
     timestamp, oldest, count, counted";

/// Record store backed by `SQLite`.
///
/// The connection is guarded by a mutex that is only held for the duration of
/// one synchronous call sequence. The async [`TelemetryStore`] methods run
/// that sequence on the blocking pool, so a caller's deadline can give up on
/// a slow write without stalling the runtime. Clones share the connection.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        store::lock(&*self.conn, "storage")
    }

    fn insert_tune(&self, tune: &TuneRecord) -> Result<i64> {
        let fingerprint = tune.fingerprint();
        let env = &tune.envelope;
        let conn = self.conn()?;

        let inserted = conn.execute(
            r"
            INSERT INTO tunes (timestamp, uuid, board, tau, addr, country, region, city,
                               lat, lon, data, fingerprint)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(fingerprint) DO NOTHING
            ",
            params![
                format_timestamp(&env.timestamp),
                tune.uuid,
                tune.board,
                tune.tau,
                env.addr,
                env.country,
                env.region,
                env.city,
                env.lat,
                env.lon,
                tune.data,
                fingerprint,
            ],
        )?;

        if inserted == 0 {
            let id: i64 = conn.query_row(
                "SELECT id FROM tunes WHERE fingerprint = ?1",
                [&fingerprint],
                |row| row.get(0),
            )?;
            debug!(id, "Tune already stored, absorbing duplicate write");
            return Ok(id);
        }

        let id = conn.last_insert_rowid();
        debug!(id, "Inserted tune");
        Ok(id)
    }

    fn select_tunes(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<TuneRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {TUNE_COLUMNS} FROM tunes {clause}"))?;
        let tunes = stmt
            .query_map(params, row_to_tune)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tunes)
    }

    fn rewrite_tunes(&self, tunes: &[TuneRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut updated = 0;

        for tune in tunes {
            let id = tune
                .id
                .ok_or_else(|| Error::internal("cannot update a tune without an id"))?;
            updated += tx.execute(
                r"
                UPDATE tunes SET uuid = ?1, board = ?2, tau = ?3, data = ?4, fingerprint = ?5
                WHERE id = ?6
                ",
                params![tune.uuid, tune.board, tune.tau, tune.data, tune.fingerprint(), id],
            )?;
        }

        tx.commit()?;
        Ok(updated)
    }

    fn insert_usage(&self, usage: &UsageRecord) -> Result<i64> {
        let fingerprint = usage.fingerprint();
        let env = &usage.envelope;
        let conn = self.conn()?;

        let inserted = conn.execute(
            r"
            INSERT INTO usage_stats (timestamp, addr, country, region, city, lat, lon, data,
                                     fingerprint)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(fingerprint) DO NOTHING
            ",
            params![
                format_timestamp(&env.timestamp),
                env.addr,
                env.country,
                env.region,
                env.city,
                env.lat,
                env.lon,
                usage.data,
                fingerprint,
            ],
        )?;

        if inserted == 0 {
            let id: i64 = conn.query_row(
                "SELECT id FROM usage_stats WHERE fingerprint = ?1",
                [&fingerprint],
                |row| row.get(0),
            )?;
            debug!(id, "Usage report already stored, absorbing duplicate write");
            return Ok(id);
        }

        Ok(conn.last_insert_rowid())
    }

    fn select_usage(&self) -> Result<Vec<UsageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_stats ORDER BY timestamp DESC, id DESC"
        ))?;
        let records = stmt
            .query_map([], row_to_usage)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn select_controller(&self, uuid: &str) -> Result<Option<FoundController>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {CONTROLLER_COLUMNS} FROM found_controllers WHERE uuid = ?1"),
                [uuid],
                row_to_controller,
            )
            .optional()?)
    }

    fn select_controllers(&self) -> Result<Vec<FoundController>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTROLLER_COLUMNS} FROM found_controllers ORDER BY timestamp DESC, uuid"
        ))?;
        let controllers = stmt
            .query_map([], row_to_controller)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(controllers)
    }

    fn transact_controllers(&self, uuids: &[String], update: &ControllerUpdate) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut created = 0;

        for uuid in uuids {
            let prior = tx
                .query_row(
                    &format!("SELECT {CONTROLLER_COLUMNS} FROM found_controllers WHERE uuid = ?1"),
                    [uuid],
                    row_to_controller,
                )
                .optional()?;
            if prior.is_none() {
                created += 1;
            }

            let next = update(uuid, prior)?;
            if next.uuid != *uuid {
                return Err(Error::internal(format!(
                    "controller update for {uuid} produced record for {}",
                    next.uuid
                )));
            }
            write_controller(&tx, &next)?;
        }

        tx.commit()?;
        debug!(identities = uuids.len(), created, "Committed controller transaction");
        Ok(created)
    }

    fn insert_crash(&self, crash: &CrashRecord) -> Result<i64> {
        let properties = serde_json::to_string(&crash.properties)?;
        let timestamp = crash.timestamp().unwrap_or_else(Utc::now);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO crashes (timestamp, properties) VALUES (?1, ?2)",
            params![format_timestamp(&timestamp), properties],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn select_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, properties FROM crashes ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit_param(limit)], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, properties)| {
                Ok(CrashRecord {
                    id: Some(id),
                    properties: serde_json::from_str(&properties)?,
                })
            })
            .collect()
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            tunes: count("tunes")?,
            usage_reports: count("usage_stats")?,
            controllers: count("found_controllers")?,
            crashes: count("crashes")?,
            db_size_bytes,
        })
    }
}

#[async_trait]
impl TelemetryStore for Storage {
    async fn put_tune(&self, tune: &TuneRecord) -> Result<i64> {
        let tune = tune.clone();
        blocking(self, move |s| s.insert_tune(&tune)).await
    }

    async fn get_tune(&self, id: i64) -> Result<Option<TuneRecord>> {
        blocking(self, move |s| Ok(s.select_tunes("WHERE id = ?1", [id])?.into_iter().next()))
            .await
    }

    async fn recent_tunes(&self, limit: usize) -> Result<Vec<TuneRecord>> {
        blocking(self, move |s| {
            s.select_tunes(
                "ORDER BY timestamp DESC, id DESC LIMIT ?1",
                [limit_param(limit)],
            )
        })
        .await
    }

    async fn tunes_oldest_first(&self) -> Result<Vec<TuneRecord>> {
        blocking(self, |s| s.select_tunes("ORDER BY timestamp ASC, id ASC", []))
            .await
    }

    async fn legacy_tunes(
        &self,
        threshold: usize,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TuneRecord>> {
        // Identity length is measured in bytes, not characters.
        blocking(self, move |s| {
            s.select_tunes(
                r"
                WHERE length(CAST(uuid AS BLOB)) < ?1 AND (?2 IS NULL OR id < ?2)
                ORDER BY id DESC LIMIT ?3
                ",
                params![limit_param(threshold), before, limit_param(limit)],
            )
        })
        .await
    }

    async fn update_tunes(&self, tunes: &[TuneRecord]) -> Result<usize> {
        let tunes = tunes.to_vec();
        blocking(self, move |s| s.rewrite_tunes(&tunes)).await
    }

    async fn put_usage(&self, usage: &UsageRecord) -> Result<i64> {
        let usage = usage.clone();
        blocking(self, move |s| s.insert_usage(&usage)).await
    }

    async fn usage_newest_first(&self) -> Result<Vec<UsageRecord>> {
        blocking(self, Storage::select_usage).await
    }

    async fn get_controller(&self, uuid: &str) -> Result<Option<FoundController>> {
        let uuid = uuid.to_string();
        blocking(self, move |s| s.select_controller(&uuid)).await
    }

    async fn controllers_newest_first(&self) -> Result<Vec<FoundController>> {
        blocking(self, Storage::select_controllers).await
    }

    async fn update_controllers(
        &self,
        uuids: &[String],
        update: Arc<ControllerUpdate>,
    ) -> Result<usize> {
        let uuids = uuids.to_vec();
        blocking(self, move |s| s.transact_controllers(&uuids, &*update))
            .await
    }

    async fn put_crash(&self, crash: &CrashRecord) -> Result<i64> {
        let crash = crash.clone();
        blocking(self, move |s| s.insert_crash(&crash)).await
    }

    async fn recent_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>> {
        blocking(self, move |s| s.select_crashes(limit)).await
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of stored tunes.
    pub tunes: i64,
    /// Number of stored usage reports.
    pub usage_reports: i64,
    /// Number of controller aggregates.
    pub controllers: i64,
    /// Number of stored crash reports.
    pub crashes: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Open a file-backed connection in WAL mode, creating parent directories.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    debug!("Opening database at {}", path.display());
    let conn = Connection::open(path).map_err(|source| Error::DatabaseOpen {
        path: path.to_path_buf(),
        source,
    })?;

    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

/// Run `op` against a clone of `handle` on the blocking pool.
///
/// Dropping the returned future abandons the wait, not the work: the call
/// already handed to `SQLite` runs to completion.
pub(crate) async fn blocking<H, T, F>(handle: &H, op: F) -> Result<T>
where
    H: Clone + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&H) -> Result<T> + Send + 'static,
{
    let handle = handle.clone();
    tokio::task::spawn_blocking(move || op(&handle))
        .await
        .map_err(|e| Error::internal(format!("blocking storage task failed: {e}")))?
}

pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_envelope(row: &rusqlite::Row, ts: usize, first: usize) -> rusqlite::Result<Envelope> {
    Ok(Envelope {
        timestamp: parse_timestamp(ts, &row.get::<_, String>(ts)?)?,
        addr: row.get(first)?,
        country: row.get(first + 1)?,
        region: row.get(first + 2)?,
        city: row.get(first + 3)?,
        lat: row.get(first + 4)?,
        lon: row.get(first + 5)?,
    })
}

fn row_to_tune(row: &rusqlite::Row) -> rusqlite::Result<TuneRecord> {
    Ok(TuneRecord {
        id: Some(row.get(0)?),
        envelope: row_envelope(row, 1, 5)?,
        uuid: row.get(2)?,
        board: row.get(3)?,
        tau: row.get(4)?,
        data: row.get(11)?,
    })
}

fn row_to_usage(row: &rusqlite::Row) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: Some(row.get(0)?),
        envelope: row_envelope(row, 1, 2)?,
        data: row.get(8)?,
    })
}

fn row_to_controller(row: &rusqlite::Row) -> rusqlite::Result<FoundController> {
    Ok(FoundController {
        uuid: row.get(0)?,
        name: row.get(1)?,
        hardware_rev: row.get(2)?,
        git_hash: row.get(3)?,
        git_tag: row.get(4)?,
        uavo_hash: row.get(5)?,
        gcs_os: row.get(6)?,
        gcs_arch: row.get(7)?,
        gcs_version: row.get(8)?,
        addr: row.get(9)?,
        country: row.get(10)?,
        region: row.get(11)?,
        city: row.get(12)?,
        lat: row.get(13)?,
        lon: row.get(14)?,
        timestamp: parse_timestamp(15, &row.get::<_, String>(15)?)?,
        oldest: parse_timestamp(16, &row.get::<_, String>(16)?)?,
        count: row.get(17)?,
        counted: row.get(18)?,
    })
}

fn write_controller(conn: &Connection, fc: &FoundController) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO found_controllers ({CONTROLLER_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            fc.uuid,
            fc.name,
            fc.hardware_rev,
            fc.git_hash,
            fc.git_tag,
            fc.uavo_hash,
            fc.gcs_os,
            fc.gcs_arch,
            fc.gcs_version,
            fc.addr,
            fc.country,
            fc.region,
            fc.city,
            fc.lat,
            fc.lon,
            format_timestamp(&fc.timestamp),
            format_timestamp(&fc.oldest),
            fc.count,
            fc.counted,
        ],
    )?;
    Ok(())
}
