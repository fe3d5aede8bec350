//! Legacy identity migration.
//!
//! Early ground stations reported raw board serials as `uniqueId`. Those are
//! rewritten to their hashed form in both the record's key and the stored
//! document, so they join the same identity the rollup path derives.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::identity::migrate_identity;
use crate::model::TuneRecord;
use crate::store::TelemetryStore;

/// What one migration batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Legacy records examined.
    pub examined: usize,
    /// Records rewritten.
    pub rewritten: usize,
    /// Records left alone because they could not be rewritten.
    pub skipped: usize,
}

/// Rewrites legacy tune identities.
pub struct IdentityMigrator {
    store: Arc<dyn TelemetryStore>,
    config: MigrationConfig,
}

impl std::fmt::Debug for IdentityMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMigrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdentityMigrator {
    /// Create a migrator.
    pub fn new(store: Arc<dyn TelemetryStore>, config: MigrationConfig) -> Self {
        Self { store, config }
    }

    /// Migrate one batch of the most recent legacy tunes.
    ///
    /// Records that fail to decode are logged and skipped; the rest are
    /// written back in a single transaction. Running it again over the same
    /// data rewrites nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the batch write fails.
    pub async fn migrate_batch(&self) -> Result<MigrationSummary> {
        let (summary, _) = self.migrate_page(None).await?;
        Ok(summary)
    }

    /// Walk every legacy tune, newest first, one batch at a time.
    ///
    /// Skipped records do not stop the walk; each batch resumes below the
    /// lowest id of the one before.
    ///
    /// # Errors
    ///
    /// Returns the first batch error.
    pub async fn migrate_all(&self) -> Result<MigrationSummary> {
        let mut total = MigrationSummary::default();
        let mut cursor = None;
        loop {
            let (batch, next) = self.migrate_page(cursor).await?;
            total.examined += batch.examined;
            total.rewritten += batch.rewritten;
            total.skipped += batch.skipped;
            if next.is_none() {
                break;
            }
            cursor = next;
        }
        info!(
            examined = total.examined,
            rewritten = total.rewritten,
            skipped = total.skipped,
            "Finished identity migration"
        );
        Ok(total)
    }

    /// Migrate the legacy tunes with ids below `before`, returning where the
    /// next page starts, or `None` once there is nothing further down.
    async fn migrate_page(&self, before: Option<i64>) -> Result<(MigrationSummary, Option<i64>)> {
        let threshold = self.config.legacy_identity_threshold;
        let batch_size = self.config.batch_size;
        let legacy = self
            .store
            .legacy_tunes(threshold, before, batch_size)
            .await?;

        let next = if legacy.len() < batch_size {
            None
        } else {
            legacy.last().and_then(|tune| tune.id)
        };
        let mut summary = MigrationSummary {
            examined: legacy.len(),
            ..MigrationSummary::default()
        };
        let mut rewritten = Vec::with_capacity(legacy.len());

        for tune in legacy {
            match rewrite_tune(tune, threshold) {
                Ok(Some(tune)) => rewritten.push(tune),
                Ok(None) => {}
                Err(e) => {
                    summary.skipped += 1;
                    warn!(error = %e, "Skipping tune during identity migration");
                }
            }
        }

        if !rewritten.is_empty() {
            summary.rewritten = self.store.update_tunes(&rewritten).await?;
        }

        info!(
            before,
            examined = summary.examined,
            rewritten = summary.rewritten,
            skipped = summary.skipped,
            "Migrated legacy identities"
        );
        Ok((summary, next))
    }
}

/// Rewrite one tune's identity, or `None` if it is already new-style.
fn rewrite_tune(mut tune: TuneRecord, threshold: usize) -> Result<Option<TuneRecord>> {
    let Some(identity) = migrate_identity(&tune.uuid, threshold) else {
        return Ok(None);
    };

    let mut document: Value = serde_json::from_slice(&tune.document()?)?;
    let Some(fields) = document.as_object_mut() else {
        return Err(Error::malformed("tune document is not an object"));
    };
    fields.insert("uniqueId".to_string(), Value::String(identity.clone()));

    debug!(id = ?tune.id, old = %tune.uuid, new = %identity, "Rewriting identity");
    tune.data = codec::compress(&serde_json::to_vec(&document)?)?;
    tune.uuid = identity;
    Ok(Some(tune))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_identity;
    use crate::model::Envelope;
    use crate::storage::Storage;
    use serde_json::json;

    async fn seed(store: &Storage, uuid: &str) -> i64 {
        let doc = json!({"uniqueId": uuid, "vehicle": {"firmware": {"board": "Sparky2"}}});
        let record =
            TuneRecord::from_document(doc.to_string().as_bytes(), Envelope::new("")).unwrap();
        store.put_tune(&record).await.unwrap()
    }

    fn migrator(store: &Arc<Storage>) -> IdentityMigrator {
        IdentityMigrator::new(store.clone(), MigrationConfig::default())
    }

    #[tokio::test]
    async fn test_rewrites_key_and_document() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let id = seed(&store, "0xDEADBEEF").await;

        let summary = migrator(&store).migrate_batch().await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.rewritten, 1);

        let tune = store.get_tune(id).await.unwrap().unwrap();
        let expected = hash_identity("0xDEADBEEF");
        assert_eq!(tune.uuid, expected);
        assert_eq!(tune.board, "Sparky2");

        let doc: Value = serde_json::from_slice(&tune.document().unwrap()).unwrap();
        assert_eq!(doc["uniqueId"], json!(expected));
        assert_eq!(doc["vehicle"]["firmware"]["board"], "Sparky2");
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        seed(&store, "legacy-1").await;
        let modern = seed(&store, &hash_identity("already")).await;

        let first = migrator(&store).migrate_batch().await.unwrap();
        assert_eq!(first.rewritten, 1);

        let second = migrator(&store).migrate_batch().await.unwrap();
        assert_eq!(second, MigrationSummary::default());

        let untouched = store.get_tune(modern).await.unwrap().unwrap();
        assert_eq!(untouched.uuid, hash_identity("already"));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_skipped() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let good = seed(&store, "good").await;
        let mut bad = TuneRecord::from_document(br#"{"uniqueId":"bad"}"#, Envelope::new("")).unwrap();
        bad.data = b"not gzip".to_vec();
        store.put_tune(&bad).await.unwrap();

        let summary = migrator(&store).migrate_batch().await.unwrap();
        assert_eq!(summary.examined, 2);
        assert_eq!(summary.rewritten, 1);
        assert_eq!(summary.skipped, 1);

        let tune = store.get_tune(good).await.unwrap().unwrap();
        assert_eq!(tune.uuid, hash_identity("good"));
    }

    #[tokio::test]
    async fn test_migrate_all_walks_batches() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        for i in 0..5 {
            seed(&store, &format!("serial-{i}")).await;
        }
        let migrator = IdentityMigrator::new(
            store.clone(),
            MigrationConfig {
                batch_size: 2,
                ..MigrationConfig::default()
            },
        );

        let total = migrator.migrate_all().await.unwrap();
        assert_eq!(total.rewritten, 5);
        assert!(store
            .recent_tunes(10)
            .await
            .unwrap()
            .iter()
            .all(|t| t.uuid.len() == 64));
    }

    async fn seed_corrupt(store: &Storage, uuid: &str) -> i64 {
        let doc = format!(r#"{{"uniqueId":"{uuid}"}}"#);
        let mut bad = TuneRecord::from_document(doc.as_bytes(), Envelope::new("")).unwrap();
        bad.data = b"not gzip".to_vec();
        store.put_tune(&bad).await.unwrap()
    }

    #[tokio::test]
    async fn test_migrate_all_continues_past_skipped_batch() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let good = seed(&store, "old-serial").await;
        seed_corrupt(&store, "bad-1").await;
        seed_corrupt(&store, "bad-2").await;
        let migrator = IdentityMigrator::new(
            store.clone(),
            MigrationConfig {
                batch_size: 2,
                ..MigrationConfig::default()
            },
        );

        let total = migrator.migrate_all().await.unwrap();
        assert_eq!(total.examined, 3);
        assert_eq!(total.skipped, 2);
        assert_eq!(total.rewritten, 1);

        let tune = store.get_tune(good).await.unwrap().unwrap();
        assert_eq!(tune.uuid, hash_identity("old-serial"));
    }

    #[tokio::test]
    async fn test_multibyte_identity_at_threshold_is_not_legacy() {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        // 40 characters, 80 bytes.
        let wide = "\u{e9}".repeat(40);
        let id = seed(&store, &wide).await;

        let total = migrator(&store).migrate_all().await.unwrap();
        assert_eq!(total, MigrationSummary::default());
        assert_eq!(store.get_tune(id).await.unwrap().unwrap().uuid, wide);
    }
}
