//! Core record types for autotown.
//!
//! Submitted documents stay opaque: only the handful of fields the pipeline
//! needs are decoded into typed structs, and the original bytes are kept
//! (compressed) for storage and export.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::codec;
use crate::error::{Error, Result};

/// Request metadata captured once when a submission arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// When the submission was received.
    pub timestamp: DateTime<Utc>,
    /// Network origin of the submitter.
    #[serde(default)]
    pub addr: String,
    /// Coarse geolocation: country code.
    #[serde(default)]
    pub country: String,
    /// Coarse geolocation: region.
    #[serde(default)]
    pub region: String,
    /// Coarse geolocation: city.
    #[serde(default)]
    pub city: String,
    /// Coarse geolocation: latitude.
    #[serde(default)]
    pub lat: f64,
    /// Coarse geolocation: longitude.
    #[serde(default)]
    pub lon: f64,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self::at(Utc::now(), addr)
    }

    /// Create an envelope with an explicit receive time.
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>, addr: impl Into<String>) -> Self {
        Self {
            timestamp,
            addr: addr.into(),
            country: String::new(),
            region: String::new(),
            city: String::new(),
            lat: 0.0,
            lon: 0.0,
        }
    }

    /// Attach coarse geolocation.
    #[must_use]
    pub fn with_location(
        mut self,
        country: impl Into<String>,
        region: impl Into<String>,
        city: impl Into<String>,
        lat_lon: &str,
    ) -> Self {
        self.country = country.into();
        self.region = region.into();
        self.city = city.into();
        (self.lat, self.lon) = Self::parse_lat_lon(lat_lon);
        self
    }

    /// Parse a `"<lat>,<lon>"` pair. Unparsable input yields `(0.0, 0.0)`.
    #[must_use]
    pub fn parse_lat_lon(value: &str) -> (f64, f64) {
        let Some((lat, lon)) = value.split_once(',') else {
            return (0.0, 0.0);
        };
        match (lat.trim().parse(), lon.trim().parse()) {
            (Ok(lat), Ok(lon)) => (lat, lon),
            _ => (0.0, 0.0),
        }
    }
}

/// Format a timestamp the way it is persisted (fixed-width, sortable).
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Fields pulled out of a tune document without validating the rest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TuneFields {
    /// Self-reported board identity.
    #[serde(rename = "uniqueId", default, deserialize_with = "null_as_default")]
    pub unique_id: String,
    /// Vehicle description.
    #[serde(default, deserialize_with = "null_as_default")]
    pub vehicle: VehicleFields,
    /// System identification results.
    #[serde(default, deserialize_with = "null_as_default")]
    pub identification: IdentificationFields,
}

/// The `vehicle` object of a tune document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VehicleFields {
    /// Firmware description.
    #[serde(default, deserialize_with = "null_as_default")]
    pub firmware: FirmwareFields,
}

/// The `vehicle.firmware` object of a tune document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FirmwareFields {
    /// Board name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub board: String,
    /// Firmware commit hash.
    #[serde(default, deserialize_with = "null_as_default")]
    pub commit: String,
    /// Firmware tag.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tag: String,
}

/// The `identification` object of a tune document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IdentificationFields {
    /// Identified time constant.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tau: f64,
}

impl TuneFields {
    /// Decode the required fields from a raw tune document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the document is not a JSON object
    /// or a known field has the wrong type.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::malformed(e.to_string()))
    }
}

/// A persisted autotune result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRecord {
    /// Identifier assigned by the store.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// Submission metadata.
    pub envelope: Envelope,
    /// Board identity.
    pub uuid: String,
    /// Board name as reported.
    pub board: String,
    /// Identified time constant.
    pub tau: f64,
    /// Gzip-compressed original document.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl TuneRecord {
    /// Build a record from a raw document, compressing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be decoded or compressed.
    pub fn from_document(raw: &[u8], envelope: Envelope) -> Result<Self> {
        let fields = TuneFields::from_json(raw)?;
        Ok(Self {
            id: None,
            envelope,
            uuid: fields.unique_id,
            board: fields.vehicle.firmware.board,
            tau: fields.identification.tau,
            data: codec::compress(raw)?,
        })
    }

    /// Decompress the original document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the stored bytes are corrupt.
    pub fn document(&self) -> Result<Vec<u8>> {
        codec::decompress(&self.data)
    }

    /// Content fingerprint used to absorb duplicate deliveries.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format_timestamp(&self.envelope.timestamp).as_bytes());
        hasher.update(self.envelope.addr.as_bytes());
        hasher.update(self.uuid.as_bytes());
        hasher.update(&self.data);
        hasher.finalize().to_hex().to_string()
    }
}

/// A persisted usage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Identifier assigned by the store.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// Submission metadata.
    pub envelope: Envelope,
    /// Gzip-compressed original document.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl UsageRecord {
    /// Build a record from a raw usage document, compressing it.
    ///
    /// The document must be a JSON object whose `BoardsSeen`, if present, is
    /// an array.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be decoded or compressed.
    pub fn from_document(raw: &[u8], envelope: Envelope) -> Result<Self> {
        UsageReport::from_json(raw)?;
        Ok(Self {
            id: None,
            envelope,
            data: codec::compress(raw)?,
        })
    }

    /// Decompress the original document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the stored bytes are corrupt.
    pub fn document(&self) -> Result<Vec<u8>> {
        codec::decompress(&self.data)
    }

    /// Content fingerprint used to absorb duplicate deliveries.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format_timestamp(&self.envelope.timestamp).as_bytes());
        hasher.update(self.envelope.addr.as_bytes());
        hasher.update(&self.data);
        hasher.finalize().to_hex().to_string()
    }
}

/// One board as seen by a ground station during one reporting window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSighting {
    /// Board ID word; the low byte is the hardware revision.
    #[serde(rename = "ID", deserialize_with = "null_as_default")]
    pub id: i64,
    /// CPU serial, the fallback identity source.
    #[serde(rename = "CPU", deserialize_with = "null_as_default")]
    pub cpu: String,
    /// Explicit unique ID.
    #[serde(rename = "UUID", deserialize_with = "null_as_default")]
    pub uuid: String,
    /// Firmware hash.
    #[serde(rename = "FwHash", deserialize_with = "null_as_default")]
    pub fw_hash: String,
    /// Firmware git hash.
    #[serde(rename = "GitHash", deserialize_with = "null_as_default")]
    pub git_hash: String,
    /// Firmware git tag.
    #[serde(rename = "GitTag", deserialize_with = "null_as_default")]
    pub git_tag: String,
    /// Board name, possibly an alias.
    #[serde(rename = "Name", deserialize_with = "null_as_default")]
    pub name: String,
    /// UAVO schema hash.
    #[serde(rename = "UavoHash", deserialize_with = "null_as_default")]
    pub uavo_hash: String,
}

/// Fields pulled out of a usage document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageReport {
    /// Boards the ground station saw.
    #[serde(rename = "BoardsSeen", deserialize_with = "null_as_default")]
    pub boards_seen: Vec<BoardSighting>,
    /// Ground station CPU architecture.
    #[serde(rename = "CurrentArch", deserialize_with = "null_as_default")]
    pub current_arch: String,
    /// Ground station operating system.
    #[serde(rename = "CurrentOS", deserialize_with = "null_as_default")]
    pub current_os: String,
    /// Ground station software version.
    #[serde(rename = "gcs_version", deserialize_with = "null_as_default")]
    pub gcs_version: String,
    /// Consent to keep the submitter's address.
    #[serde(rename = "ShareIP", deserialize_with = "consent_flag")]
    pub share_ip: String,
}

impl UsageReport {
    /// Decode the required fields from a raw usage document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the document does not decode.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Decode from an already parsed document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the document does not decode.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Self::deserialize(value).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Whether the submitter explicitly agreed to share their address.
    #[must_use]
    pub fn shares_ip(&self) -> bool {
        self.share_ip == "true"
    }
}

// Loosely typed clients send `null` for fields they have no value for.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Older ground stations sent a JSON boolean.
fn consent_flag<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Text(String),
        Bool(bool),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Text(s)) => s,
        Some(Flag::Bool(b)) => b.to_string(),
        None => String::new(),
    })
}

/// Self-contained rollup-lane payload: envelope facts plus the raw report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncUsageData {
    /// Submitter address.
    #[serde(rename = "IP", default)]
    pub ip: String,
    /// Country code.
    #[serde(rename = "Country", default)]
    pub country: String,
    /// Region.
    #[serde(rename = "Region", default)]
    pub region: String,
    /// City.
    #[serde(rename = "City", default)]
    pub city: String,
    /// Latitude.
    #[serde(rename = "Lat", default)]
    pub lat: f64,
    /// Longitude.
    #[serde(rename = "Lon", default)]
    pub lon: f64,
    /// When the report was received.
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    /// The original usage document.
    #[serde(rename = "RawData")]
    pub raw_data: serde_json::Value,
}

impl AsyncUsageData {
    /// Pair an envelope with a decoded usage document.
    #[must_use]
    pub fn new(envelope: &Envelope, raw_data: serde_json::Value) -> Self {
        Self {
            ip: envelope.addr.clone(),
            country: envelope.country.clone(),
            region: envelope.region.clone(),
            city: envelope.city.clone(),
            lat: envelope.lat,
            lon: envelope.lon,
            timestamp: envelope.timestamp,
            raw_data,
        }
    }

    /// Rebuild the rollup payload for a stored usage record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the record does not decompress, or a JSON
    /// error if the document is not JSON.
    pub fn from_record(record: &UsageRecord) -> Result<Self> {
        let raw = record.document()?;
        let value = serde_json::from_slice(&raw)?;
        Ok(Self::new(&record.envelope, value))
    }

    /// Encode as a gzip-compressed JSON queue payload.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or compression fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        codec::compress(&serde_json::to_vec(self)?)
    }

    /// Decode a queue payload produced by [`AsyncUsageData::to_payload`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decompress or decode.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let raw = codec::decompress(payload)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// The aggregate record kept for each board identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundController {
    /// Resolved identity (primary key).
    pub uuid: String,
    /// Canonical board name.
    pub name: String,
    /// Hardware revision.
    pub hardware_rev: i64,
    /// Firmware git hash.
    pub git_hash: String,
    /// Firmware git tag.
    pub git_tag: String,
    /// UAVO schema hash.
    pub uavo_hash: String,
    /// Ground station OS.
    pub gcs_os: String,
    /// Ground station architecture.
    pub gcs_arch: String,
    /// Ground station version.
    pub gcs_version: String,
    /// Submitter address, empty unless consented.
    pub addr: String,
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
    /// Time of the most recent contributing report.
    pub timestamp: DateTime<Utc>,
    /// Earliest time this identity was observed.
    pub oldest: DateTime<Utc>,
    /// Number of contributing sightings.
    pub count: i64,
    /// Downstream dedup flag; never cleared once set.
    pub counted: bool,
}

/// A value in a crash report's property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Text.
    String(String),
    /// Any JSON number.
    Number(f64),
    /// A boolean.
    Bool(bool),
    /// A point in time.
    Timestamp(DateTime<Utc>),
}

impl PropertyValue {
    /// Convert a submitted JSON value.
    ///
    /// Nested arrays and objects are kept as their JSON text; `null` is
    /// dropped.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::String(s)),
            nested @ (Value::Array(_) | Value::Object(_)) => Some(Self::String(nested.to_string())),
        }
    }

    /// Borrow the text of a string property.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A stored crash report: a schema-free property bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    /// Identifier assigned by the store.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// Submitted and derived properties.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl CrashRecord {
    /// The `timestamp` property, if present.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.properties.get("timestamp") {
            Some(PropertyValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }
}

/// Where a stored record can be retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    /// Store-assigned identifier.
    pub id: i64,
    /// Public URL of the record.
    pub url: String,
}

impl Locator {
    /// Build a locator from a base URL and record id.
    #[must_use]
    pub fn new(base_url: &str, id: i64) -> Self {
        Self {
            id,
            url: format!("{base_url}{id}"),
        }
    }

    /// Recover the record id from a locator URL or bare id.
    #[must_use]
    pub fn parse_id(value: &str) -> Option<i64> {
        value
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .and_then(|segment| segment.parse().ok())
    }
}

/// Serde adapter storing byte buffers as standard base64 text.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
