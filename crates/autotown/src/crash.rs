//! Crash report intake.
//!
//! A crash report is a JSON object carrying a base64 `dump`. The dump goes to
//! a [`BlobSink`] under a content-addressed name, and the remaining
//! properties, plus the dump's name and the submission envelope, are stored
//! as a [`CrashRecord`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{CrashRecord, Envelope, PropertyValue};
use crate::store::{lock, TelemetryStore};

/// Destination for raw crash dumps.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Write `data` under `name`, replacing any existing blob.
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// Writes blobs as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    /// Create a sink rooted at `root`. Directories are created on demand.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::store_unavailable(format!("writing {}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = data.len(), "Wrote blob");
        Ok(())
    }
}

/// In-process [`BlobSink`].
#[derive(Debug, Default)]
pub struct MemoryBlobSink {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a blob by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink's lock is poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.blobs, "blob sink")?.get(name).cloned())
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        lock(&self.blobs, "blob sink")?.insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// Blob name for a dump: `crash/<first two hex digits>/<rest>`.
#[must_use]
pub fn dump_name(dump: &[u8]) -> String {
    let digest = blake3::hash(dump).to_hex();
    format!("crash/{}/{}", &digest[..2], &digest[2..])
}

/// Store one crash report.
///
/// # Errors
///
/// - [`Error::MalformedInput`] if the report is not a JSON object or its
///   `dump` is missing or not valid base64.
/// - Any sink or store error.
pub async fn store_crash(
    store: &dyn TelemetryStore,
    sink: &dyn BlobSink,
    raw: &[u8],
    envelope: &Envelope,
) -> Result<i64> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| Error::malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(Error::malformed("crash report is not a JSON object"));
    };

    let dump = match fields.remove("dump") {
        Some(Value::String(encoded)) => STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::malformed(format!("bad crash dump: {e}")))?,
        _ => return Err(Error::malformed("crash report has no dump")),
    };

    let name = dump_name(&dump);
    if let Err(e) = sink.write(&name, &dump).await {
        warn!(error = %e, name, "Failed to write crash dump");
        return Err(e);
    }

    let mut crash = CrashRecord::default();
    for (key, value) in fields {
        if let Some(property) = PropertyValue::from_json(value) {
            crash.properties.insert(key, property);
        }
    }

    let text = |s: &str| PropertyValue::String(s.to_string());
    let props = &mut crash.properties;
    props.insert("file".to_string(), text(&name));
    props.insert(
        "timestamp".to_string(),
        PropertyValue::Timestamp(envelope.timestamp),
    );
    props.insert("addr".to_string(), text(&envelope.addr));
    props.insert("country".to_string(), text(&envelope.country));
    props.insert("region".to_string(), text(&envelope.region));
    props.insert("city".to_string(), text(&envelope.city));
    props.insert("lat".to_string(), PropertyValue::Number(envelope.lat));
    props.insert("lon".to_string(), PropertyValue::Number(envelope.lon));

    let id = store.put_crash(&crash).await?;
    info!(id, file = %name, bytes = dump.len(), "Stored crash report");
    Ok(id)
}
