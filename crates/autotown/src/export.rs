//! Read paths and bulk exports.
//!
//! Public views never expose board identities: each distinct identity is
//! replaced by a small sequential number, assigned in the order the records
//! are visited.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::{abbreviate_os, canonical_board_name};
use crate::model::{CrashRecord, Locator, TuneRecord};
use crate::store::TelemetryStore;

/// Fixed leading columns of the tune CSV export.
pub const TUNE_CSV_HEADER: &[&str] = &["timestamp", "id", "country", "region", "city", "lat", "lon"];

/// Document fields appended to each tune CSV row, as JSON pointers.
pub const TUNE_DOCUMENT_COLUMNS: &[&str] = &[
    "/vehicle/batteryCells",
    "/vehicle/esc",
    "/vehicle/motor",
    "/vehicle/size",
    "/vehicle/type",
    "/vehicle/weight",
    "/vehicle/firmware/board",
    "/vehicle/firmware/commit",
    "/vehicle/firmware/date",
    "/vehicle/firmware/tag",
    "/identification/tau",
    "/identification/pitch/bias",
    "/identification/pitch/gain",
    "/identification/pitch/noise",
    "/identification/roll/bias",
    "/identification/roll/gain",
    "/identification/roll/noise",
    "/tuning/parameters/damping",
    "/tuning/parameters/noiseSensitivity",
    "/tuning/computed/derivativeCutoff",
    "/tuning/computed/naturalFrequency",
    "/tuning/computed/gains/outer/kp",
    "/tuning/computed/gains/pitch/kp",
    "/tuning/computed/gains/pitch/ki",
    "/tuning/computed/gains/pitch/kd",
    "/tuning/computed/gains/roll/kp",
    "/tuning/computed/gains/roll/ki",
    "/tuning/computed/gains/roll/kd",
    "/userObservations",
];

/// Columns of the board CSV export.
pub const BOARD_CSV_HEADER: &[&str] = &[
    "timestamp",
    "oldest",
    "count",
    "uuid",
    "name",
    "hwrev",
    "git_hash",
    "git_tag",
    "ref",
    "uavo_hash",
    "gcs_os",
    "gcs_os_abbrev",
    "gcs_arch",
    "gcs_version",
    "country",
    "region",
    "city",
    "lat",
    "lon",
];

/// Default number of records returned by the "recent" views.
pub const RECENT_LIMIT: usize = 50;

/// Counts from one export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Rows written.
    pub written: usize,
    /// Records skipped because they could not be decoded.
    pub skipped: usize,
}

/// Assigns stable sequential ids to identities.
#[derive(Debug, Default)]
pub struct AnonymousIds {
    ids: HashMap<String, usize>,
}

impl AnonymousIds {
    /// Create an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The anonymous id for `identity`, assigning the next one if unseen.
    pub fn id_for(&mut self, identity: &str) -> String {
        let next = self.ids.len() + 1;
        self.ids
            .entry(identity.to_string())
            .or_insert(next)
            .to_string()
    }
}

/// Header name for a JSON pointer column: `/a/b` becomes `a.b`.
#[must_use]
pub fn column_name(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

/// Extract the given pointers from a document as display strings.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] naming the first missing field.
pub fn extract_columns(document: &Value, pointers: &[&str]) -> Result<Vec<String>> {
    pointers
        .iter()
        .map(|pointer| {
            document
                .pointer(pointer)
                .map(display_value)
                .ok_or_else(|| Error::malformed(format!("field {pointer} not found")))
        })
        .collect()
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write one CSV record, quoting fields that need it.
fn write_csv_row<W, S>(w: &mut W, fields: &[S]) -> Result<()>
where
    W: Write,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        let field = field.as_ref();
        if field.contains([',', '"', '\n', '\r']) || field.starts_with(' ') {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(field);
        }
    }
    line.push('\n');
    w.write_all(line.as_bytes())?;
    Ok(())
}

/// Export every tune, oldest first, as CSV.
///
/// Tunes whose document is corrupt or lacks one of the
/// [`TUNE_DOCUMENT_COLUMNS`] are skipped.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the writer fails.
pub async fn write_tunes_csv<W: Write>(
    store: &dyn TelemetryStore,
    w: &mut W,
) -> Result<ExportSummary> {
    let tunes = store.tunes_oldest_first().await?;
    let mut summary = ExportSummary::default();
    let mut ids = AnonymousIds::new();

    let header: Vec<String> = TUNE_CSV_HEADER
        .iter()
        .map(|h| (*h).to_string())
        .chain(TUNE_DOCUMENT_COLUMNS.iter().map(|p| column_name(p)))
        .collect();
    write_csv_row(w, &header)?;

    for tune in &tunes {
        let values = match decode_document(tune)
            .and_then(|doc| extract_columns(&doc, TUNE_DOCUMENT_COLUMNS))
        {
            Ok(values) => values,
            Err(e) => {
                summary.skipped += 1;
                debug!(error = %e, id = ?tune.id, "Skipping tune in CSV export");
                continue;
            }
        };

        let env = &tune.envelope;
        let mut row = vec![
            format_time(&env.timestamp),
            ids.id_for(&tune.uuid),
            env.country.clone(),
            env.region.clone(),
            env.city.clone(),
            env.lat.to_string(),
            env.lon.to_string(),
        ];
        row.extend(values);
        write_csv_row(w, &row)?;
        summary.written += 1;
    }

    info!(written = summary.written, skipped = summary.skipped, "Exported tunes as CSV");
    Ok(summary)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TuneExportLine<'a> {
    id: String,
    timestamp: DateTime<Utc>,
    addr: &'a str,
    country: &'a str,
    region: &'a str,
    city: &'a str,
    lat: f64,
    lon: f64,
    tune_data: Value,
}

/// Export every tune, oldest first, as one JSON object per line.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the writer fails.
pub async fn write_tunes_json<W: Write>(
    store: &dyn TelemetryStore,
    w: &mut W,
) -> Result<ExportSummary> {
    let tunes = store.tunes_oldest_first().await?;
    let mut summary = ExportSummary::default();
    let mut ids = AnonymousIds::new();

    for tune in &tunes {
        let tune_data = match decode_document(tune) {
            Ok(doc) => doc,
            Err(e) => {
                summary.skipped += 1;
                debug!(error = %e, id = ?tune.id, "Skipping tune in JSON export");
                continue;
            }
        };

        let env = &tune.envelope;
        let line = TuneExportLine {
            id: ids.id_for(&tune.uuid),
            timestamp: env.timestamp,
            addr: &env.addr,
            country: &env.country,
            region: &env.region,
            city: &env.city,
            lat: env.lat,
            lon: env.lon,
            tune_data,
        };
        serde_json::to_writer(&mut *w, &line)?;
        w.write_all(b"\n")?;
        summary.written += 1;
    }

    info!(written = summary.written, skipped = summary.skipped, "Exported tunes as JSON");
    Ok(summary)
}

/// Export every controller aggregate, most recently seen first, as CSV.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the writer fails.
pub async fn write_boards_csv<W: Write>(
    store: &dyn TelemetryStore,
    w: &mut W,
) -> Result<ExportSummary> {
    let controllers = store.controllers_newest_first().await?;
    write_csv_row(w, BOARD_CSV_HEADER)?;

    for fc in &controllers {
        let row = [
            format_time(&fc.timestamp),
            format_time(&fc.oldest),
            fc.count.to_string(),
            fc.uuid.clone(),
            canonical_board_name(&fc.name),
            fc.hardware_rev.to_string(),
            fc.git_hash.clone(),
            fc.git_tag.clone(),
            String::new(),
            fc.uavo_hash.clone(),
            fc.gcs_os.clone(),
            abbreviate_os(&fc.gcs_os).to_string(),
            fc.gcs_arch.clone(),
            fc.gcs_version.clone(),
            fc.country.clone(),
            fc.region.clone(),
            fc.city.clone(),
            fc.lat.to_string(),
            fc.lon.to_string(),
        ];
        write_csv_row(w, &row)?;
    }

    info!(written = controllers.len(), "Exported boards as CSV");
    Ok(ExportSummary {
        written: controllers.len(),
        skipped: 0,
    })
}

/// A tune as shown in listings, with its identity anonymized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneSummary {
    /// Store id.
    pub id: i64,
    /// Anonymous board number.
    pub uuid: String,
    /// Board name.
    pub board: String,
    /// Identified time constant.
    pub tau: f64,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
    /// Country code.
    pub country: String,
    /// Region.
    pub region: String,
    /// City.
    pub city: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

/// The most recent tunes, newest first, with anonymized identities.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn recent_tunes(store: &dyn TelemetryStore, limit: usize) -> Result<Vec<TuneSummary>> {
    let tunes = store.recent_tunes(limit).await?;
    let mut ids = AnonymousIds::new();

    Ok(tunes
        .into_iter()
        .map(|tune| TuneSummary {
            id: tune.id.unwrap_or_default(),
            uuid: ids.id_for(&tune.uuid),
            board: tune.board,
            tau: tune.tau,
            timestamp: tune.envelope.timestamp,
            country: tune.envelope.country,
            region: tune.envelope.region,
            city: tune.envelope.city,
            lat: tune.envelope.lat,
            lon: tune.envelope.lon,
        })
        .collect())
}

/// One tune with its original document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneDetail {
    /// Store id.
    pub id: i64,
    /// Board identity.
    pub uuid: String,
    /// Board name.
    pub board: String,
    /// Identified time constant.
    pub tau: f64,
    /// Submission time.
    pub timestamp: DateTime<Utc>,
    /// Country code.
    pub country: String,
    /// Region.
    pub region: String,
    /// City.
    pub city: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
    /// The submitted document.
    pub orig: Value,
}

/// Fetch one tune by locator URL or bare id.
///
/// # Errors
///
/// - [`Error::MalformedInput`] if `locator` holds no id.
/// - [`Error::NotFound`] if no such tune exists.
/// - [`Error::Codec`] if the stored document is corrupt.
pub async fn tune_detail(store: &dyn TelemetryStore, locator: &str) -> Result<TuneDetail> {
    let id = Locator::parse_id(locator)
        .ok_or_else(|| Error::malformed(format!("not a tune locator: {locator}")))?;
    let tune = store
        .get_tune(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("tune {id}")))?;
    let orig = decode_document(&tune)?;

    Ok(TuneDetail {
        id,
        uuid: tune.uuid,
        board: tune.board,
        tau: tune.tau,
        timestamp: tune.envelope.timestamp,
        country: tune.envelope.country,
        region: tune.envelope.region,
        city: tune.envelope.city,
        lat: tune.envelope.lat,
        lon: tune.envelope.lon,
        orig,
    })
}

/// The most recent crash reports, newest first.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn recent_crashes(store: &dyn TelemetryStore, limit: usize) -> Result<Vec<CrashRecord>> {
    store.recent_crashes(limit).await
}

fn decode_document(tune: &TuneRecord) -> Result<Value> {
    let raw = tune.document()?;
    Ok(serde_json::from_slice(&raw)?)
}
