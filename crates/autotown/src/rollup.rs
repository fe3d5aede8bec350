//! Rollup merge engine.
//!
//! Folds one usage report into the per-identity [`FoundController`]
//! aggregates. Reports may arrive late, twice, or concurrently with other
//! reports for the same board, so the merge rules are written to be safe
//! under all three:
//!
//! - current-state fields follow the newest report (`report.ts >= stored.ts`),
//! - `oldest` only moves back in time and `count` only grows,
//! - a report without address-sharing consent always clears the address.
//!
//! All identities touched by one report are written in a single store
//! transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info};

use crate::config::RollupConfig;
use crate::error::{Error, Result};
use crate::identity::{canonical_board_name, resolve_identity};
use crate::model::{AsyncUsageData, BoardSighting, FoundController, UsageReport};
use crate::store::{ControllerUpdate, StatsCache, TelemetryStore};

/// Cache key of the precomputed rollup statistics.
pub const RESULTS_STATS_KEY: &str = "resultsStats";

/// Times before this year are treated as unset.
const EARLIEST_VALID_YEAR: i32 = 1000;

/// What one merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Sightings in the report.
    pub sightings: usize,
    /// Sightings dropped for lack of an identity.
    pub skipped: usize,
    /// Distinct identities merged.
    pub identities: usize,
    /// Identities seen for the first time.
    pub new_controllers: usize,
}

/// Aggregate contribution of one report to one identity, before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerCandidate {
    /// The record this report alone would produce.
    pub controller: FoundController,
    /// Whether the submitter agreed to keep their address.
    pub shares_ip: bool,
}

/// Collapse sightings by resolved identity; the last sighting for an
/// identity wins. Returns the survivors and the number skipped.
#[must_use]
pub fn dedupe_sightings(sightings: &[BoardSighting]) -> (BTreeMap<String, &BoardSighting>, usize) {
    let mut seen = BTreeMap::new();
    let mut skipped = 0;

    for sighting in sightings {
        match resolve_identity(&sighting.uuid, &sighting.cpu) {
            Ok(uuid) => {
                seen.insert(uuid, sighting);
            }
            Err(e) => {
                skipped += 1;
                info!(error = %e, name = %sighting.name, id = sighting.id, "Skipping sighting");
            }
        }
    }

    (seen, skipped)
}

/// Build the candidate aggregate for one sighting of one report.
#[must_use]
pub fn build_candidate(
    uuid: &str,
    sighting: &BoardSighting,
    report: &UsageReport,
    data: &AsyncUsageData,
) -> ControllerCandidate {
    let shares_ip = report.shares_ip();
    ControllerCandidate {
        controller: FoundController {
            uuid: uuid.to_string(),
            name: canonical_board_name(&sighting.name),
            hardware_rev: sighting.id & 0xff,
            git_hash: sighting.git_hash.clone(),
            git_tag: sighting.git_tag.clone(),
            uavo_hash: sighting.uavo_hash.clone(),
            gcs_os: report.current_os.clone(),
            gcs_arch: report.current_arch.clone(),
            gcs_version: report.gcs_version.clone(),
            addr: if shares_ip {
                data.ip.clone()
            } else {
                String::new()
            },
            country: data.country.clone(),
            region: data.region.clone(),
            city: data.city.clone(),
            lat: data.lat,
            lon: data.lon,
            timestamp: data.timestamp,
            oldest: data.timestamp,
            count: 1,
            counted: false,
        },
        shares_ip,
    }
}

/// Merge a candidate into the stored aggregate, if any.
#[must_use]
pub fn merge_controller(
    prior: Option<FoundController>,
    candidate: &ControllerCandidate,
) -> FoundController {
    let Some(prior) = prior else {
        return candidate.controller.clone();
    };
    let incoming = &candidate.controller;

    let mut merged = if incoming.timestamp >= prior.timestamp {
        incoming.clone()
    } else {
        prior.clone()
    };

    merged.timestamp = prior.timestamp.max(incoming.timestamp);
    merged.oldest = older_time(
        older_time(prior.oldest, prior.timestamp),
        older_time(incoming.oldest, incoming.timestamp),
    );
    merged.count = prior.count.saturating_add(1);
    merged.counted = prior.counted || incoming.counted;

    if !candidate.shares_ip {
        merged.addr.clear();
    }

    merged
}

/// The earlier of two times, ignoring unset ones.
#[must_use]
pub fn older_time(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    if a.year() < EARLIEST_VALID_YEAR {
        b
    } else if b.year() < EARLIEST_VALID_YEAR {
        a
    } else {
        a.min(b)
    }
}

/// Applies usage reports to the controller aggregates.
pub struct RollupEngine {
    store: Arc<dyn TelemetryStore>,
    cache: Arc<dyn StatsCache>,
    config: RollupConfig,
}

impl std::fmt::Debug for RollupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RollupEngine {
    /// Create an engine over `store`, invalidating `cache` after each merge.
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        cache: Arc<dyn StatsCache>,
        config: RollupConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Merge one report.
    ///
    /// Either every identity in the report is updated or none is.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedInput`] if the embedded document is not a usage report.
    /// - Any store error from the transaction, which leaves the aggregates untouched.
    /// - [`Error::Timeout`] if the configured deadline expires.
    pub async fn merge_report(&self, data: &AsyncUsageData) -> Result<MergeSummary> {
        let report = UsageReport::from_value(&data.raw_data)?;
        let (seen, skipped) = dedupe_sightings(&report.boards_seen);

        let candidates: BTreeMap<String, ControllerCandidate> = seen
            .iter()
            .map(|(uuid, sighting)| {
                (
                    uuid.clone(),
                    build_candidate(uuid, sighting, &report, data),
                )
            })
            .collect();

        let mut summary = MergeSummary {
            sightings: report.boards_seen.len(),
            skipped,
            identities: candidates.len(),
            new_controllers: 0,
        };

        if candidates.is_empty() {
            debug!(skipped, "Report has no resolvable sightings");
            return Ok(summary);
        }

        let uuids: Vec<String> = candidates.keys().cloned().collect();
        let update: Arc<ControllerUpdate> =
            Arc::new(move |uuid: &str, prior: Option<FoundController>| {
                candidates
                    .get(uuid)
                    .map(|candidate| merge_controller(prior, candidate))
                    .ok_or_else(|| Error::internal(format!("no candidate for identity {uuid}")))
            });

        let created = tokio::time::timeout(
            self.config.deadline(),
            self.store.update_controllers(&uuids, update),
        )
        .await
        .map_err(|_| Error::timeout("rollup merge"))??;
        summary.new_controllers = created;

        info!(
            identities = summary.identities,
            new = created,
            skipped,
            "Merged usage report"
        );

        self.cache.invalidate(RESULTS_STATS_KEY).await;
        Ok(summary)
    }
}
