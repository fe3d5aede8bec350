//! `SQLite` schema definitions for autotown.
//!
//! This module contains the SQL statements for creating the record store and
//! the durable work queue.

/// SQL statement to create the tunes table.
pub const CREATE_TUNES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS tunes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    uuid TEXT NOT NULL,
    board TEXT NOT NULL,
    tau REAL NOT NULL,
    addr TEXT NOT NULL,
    country TEXT NOT NULL,
    region TEXT NOT NULL,
    city TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    data BLOB NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create an index on tune timestamps.
pub const CREATE_TUNES_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_tunes_timestamp ON tunes(timestamp DESC)
";

/// SQL statement to create an index on tune identities.
pub const CREATE_TUNES_UUID_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_tunes_uuid ON tunes(uuid)
";

/// SQL statement to create the usage stats table.
pub const CREATE_USAGE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS usage_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    addr TEXT NOT NULL,
    country TEXT NOT NULL,
    region TEXT NOT NULL,
    city TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    data BLOB NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create an index on usage timestamps.
pub const CREATE_USAGE_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_stats(timestamp DESC)
";

/// SQL statement to create the controller aggregate table.
pub const CREATE_CONTROLLERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS found_controllers (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    hardware_rev INTEGER NOT NULL,
    git_hash TEXT NOT NULL,
    git_tag TEXT NOT NULL,
    uavo_hash TEXT NOT NULL,
    gcs_os TEXT NOT NULL,
    gcs_arch TEXT NOT NULL,
    gcs_version TEXT NOT NULL,
    addr TEXT NOT NULL,
    country TEXT NOT NULL,
    region TEXT NOT NULL,
    city TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    timestamp TEXT NOT NULL,
    oldest TEXT NOT NULL,
    count INTEGER NOT NULL,
    counted INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create an index on controller timestamps.
pub const CREATE_CONTROLLERS_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_controllers_timestamp ON found_controllers(timestamp DESC)
";

/// SQL statement to create the crash report table.
pub const CREATE_CRASHES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS crashes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    properties TEXT NOT NULL
)
";

/// SQL statement to create an index on crash timestamps.
pub const CREATE_CRASHES_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_crashes_timestamp ON crashes(timestamp DESC)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create the work queue table.
pub const CREATE_QUEUE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS queue_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lane TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    leased_until TEXT,
    last_error TEXT,
    parked INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create an index for leasing messages in order.
pub const CREATE_QUEUE_LANE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_queue_lane ON queue_messages(lane, parked, id)
";

/// All record store creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_TUNES_TABLE,
    CREATE_TUNES_TIMESTAMP_INDEX,
    CREATE_TUNES_UUID_INDEX,
    CREATE_USAGE_TABLE,
    CREATE_USAGE_TIMESTAMP_INDEX,
    CREATE_CONTROLLERS_TABLE,
    CREATE_CONTROLLERS_TIMESTAMP_INDEX,
    CREATE_CRASHES_TABLE,
    CREATE_CRASHES_TIMESTAMP_INDEX,
    CREATE_METADATA_TABLE,
];

/// All work queue creation statements in order.
pub const QUEUE_SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_QUEUE_TABLE,
    CREATE_QUEUE_LANE_INDEX,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        for stmt in SCHEMA_STATEMENTS.iter().chain(QUEUE_SCHEMA_STATEMENTS) {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_controllers_keyed_by_identity() {
        assert!(CREATE_CONTROLLERS_TABLE.contains("uuid TEXT PRIMARY KEY"));
        assert!(CREATE_CONTROLLERS_TABLE.contains("oldest TEXT NOT NULL"));
        assert!(CREATE_CONTROLLERS_TABLE.contains("count INTEGER NOT NULL"));
    }

    #[test]
    fn test_records_deduplicate_by_fingerprint() {
        assert!(CREATE_TUNES_TABLE.contains("fingerprint TEXT NOT NULL UNIQUE"));
        assert!(CREATE_USAGE_TABLE.contains("fingerprint TEXT NOT NULL UNIQUE"));
    }
}
