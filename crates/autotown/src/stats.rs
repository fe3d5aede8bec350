//! Rollup statistics.
//!
//! A summary of the controller aggregates, computed on demand and cached
//! under [`RESULTS_STATS_KEY`]. Every merge drops the cached copy, so the
//! next read recomputes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::{abbreviate_os, canonical_board_name};
use crate::model::FoundController;
use crate::rollup::RESULTS_STATS_KEY;
use crate::store::{StatsCache, TelemetryStore};

/// Summary of all known controllers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupStats {
    /// When the snapshot was computed.
    pub computed_at: Option<DateTime<Utc>>,
    /// Distinct board identities.
    pub controllers: usize,
    /// Sum of sightings over all identities.
    pub sightings: i64,
    /// Identities flagged as counted downstream.
    pub counted: usize,
    /// Identities per canonical board name.
    pub by_board: BTreeMap<String, usize>,
    /// Identities per ground station OS family.
    pub by_os: BTreeMap<String, usize>,
    /// Identities per country code; unknown locations are keyed `""`.
    pub by_country: BTreeMap<String, usize>,
    /// Most recent sighting of any board.
    pub newest: Option<DateTime<Utc>>,
    /// Earliest sighting of any board.
    pub oldest: Option<DateTime<Utc>>,
}

impl RollupStats {
    /// Summarize a set of controllers.
    #[must_use]
    pub fn compute(controllers: &[FoundController], now: DateTime<Utc>) -> Self {
        let mut stats = Self {
            computed_at: Some(now),
            controllers: controllers.len(),
            ..Self::default()
        };

        for fc in controllers {
            stats.sightings += fc.count;
            if fc.counted {
                stats.counted += 1;
            }
            *stats
                .by_board
                .entry(canonical_board_name(&fc.name))
                .or_default() += 1;
            *stats
                .by_os
                .entry(abbreviate_os(&fc.gcs_os).to_string())
                .or_default() += 1;
            *stats.by_country.entry(fc.country.clone()).or_default() += 1;

            stats.newest = stats.newest.max(Some(fc.timestamp));
            stats.oldest = Some(stats.oldest.map_or(fc.oldest, |o| o.min(fc.oldest)));
        }
        stats
    }
}

/// Serves [`RollupStats`] through the stats cache.
pub struct StatsService {
    store: Arc<dyn TelemetryStore>,
    cache: Arc<dyn StatsCache>,
}

impl std::fmt::Debug for StatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsService").finish_non_exhaustive()
    }
}

impl StatsService {
    /// Create a service reading `store` and caching in `cache`.
    pub fn new(store: Arc<dyn TelemetryStore>, cache: Arc<dyn StatsCache>) -> Self {
        Self { store, cache }
    }

    /// Return the cached snapshot, computing and caching it on a miss.
    ///
    /// An unreadable cache entry counts as a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the controllers cannot be read.
    pub async fn snapshot(&self) -> Result<RollupStats> {
        if let Some(cached) = self.cache.get(RESULTS_STATS_KEY).await {
            match serde_json::from_slice(&cached) {
                Ok(stats) => {
                    debug!("Stats cache hit");
                    return Ok(stats);
                }
                Err(e) => warn!(error = %e, "Discarding unreadable stats cache entry"),
            }
        }
        self.refresh().await
    }

    /// Recompute the snapshot and replace the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the controllers cannot be read.
    pub async fn refresh(&self) -> Result<RollupStats> {
        let controllers = self.store.controllers_newest_first().await?;
        let stats = RollupStats::compute(&controllers, Utc::now());
        debug!(controllers = stats.controllers, "Computed rollup stats");

        match serde_json::to_vec(&stats) {
            Ok(encoded) => self.cache.put(RESULTS_STATS_KEY, encoded).await,
            Err(e) => warn!(error = %e, "Failed to encode rollup stats for caching"),
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use crate::model::{AsyncUsageData, Envelope};
    use crate::rollup::RollupEngine;
    use crate::storage::Storage;
    use crate::store::MemoryStatsCache;
    use chrono::TimeZone;
    use serde_json::json;

    fn report(country: &str, os: &str, boards: serde_json::Value) -> AsyncUsageData {
        let ts = Utc.with_ymd_and_hms(2017, 3, 1, 0, 0, 0).unwrap();
        let env = Envelope::at(ts, "").with_location(country, "", "", "");
        AsyncUsageData::new(&env, json!({"BoardsSeen": boards, "CurrentOS": os}))
    }

    struct Fixture {
        cache: Arc<MemoryStatsCache>,
        engine: RollupEngine,
        service: StatsService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Storage::open_in_memory().unwrap());
        let cache = Arc::new(MemoryStatsCache::new());
        Fixture {
            engine: RollupEngine::new(store.clone(), cache.clone(), RollupConfig::default()),
            service: StatsService::new(store, cache.clone()),
            cache,
        }
    }

    #[tokio::test]
    async fn test_snapshot_summarizes_controllers() {
        let f = fixture();
        f.engine
            .merge_report(&report(
                "us",
                "Windows 10",
                json!([{"UUID": "a", "Name": "CopterControl"}, {"UUID": "b", "Name": "Sparky2"}]),
            ))
            .await
            .unwrap();
        f.engine
            .merge_report(&report("de", "OS X 10.12", json!([{"UUID": "a", "Name": "CopterControl"}])))
            .await
            .unwrap();

        let stats = f.service.snapshot().await.unwrap();
        assert_eq!(stats.controllers, 2);
        assert_eq!(stats.sightings, 3);
        assert_eq!(stats.by_board["CC3D"], 1);
        assert_eq!(stats.by_board["Sparky2"], 1);
        assert_eq!(stats.by_os["Mac"], 1);
        assert_eq!(stats.by_os["Windows"], 1);
        assert_eq!(stats.by_country["de"], 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_cached_until_merge() {
        let f = fixture();
        let empty = f.service.snapshot().await.unwrap();
        assert_eq!(empty.controllers, 0);
        assert!(f.cache.get(RESULTS_STATS_KEY).await.is_some());

        // Served from cache: same computation time.
        let again = f.service.snapshot().await.unwrap();
        assert_eq!(again.computed_at, empty.computed_at);

        f.engine
            .merge_report(&report("us", "Linux", json!([{"UUID": "x"}])))
            .await
            .unwrap();
        assert!(f.cache.get(RESULTS_STATS_KEY).await.is_none());

        let fresh = f.service.snapshot().await.unwrap();
        assert_eq!(fresh.controllers, 1);
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_is_recomputed() {
        let f = fixture();
        f.cache.put(RESULTS_STATS_KEY, b"garbage".to_vec()).await;

        let stats = f.service.snapshot().await.unwrap();
        assert_eq!(stats.controllers, 0);
        assert!(stats.computed_at.is_some());
    }

    #[test]
    fn test_compute_empty() {
        let stats = RollupStats::compute(&[], Utc::now());
        assert_eq!(stats.controllers, 0);
        assert!(stats.newest.is_none());
        assert!(stats.oldest.is_none());
    }
}
