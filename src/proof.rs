//! Proof payload schemas and the canonical signable message.
//!
//! Two wire versions are accepted. v1 is flat; v2 nests the location and
//! carries the optional attestation, GNSS, cell, Wi-Fi and device records.
//! Numeric fields travel as strings: the canonical message is re-assembled
//! character-for-character from the submitted text, so the server never
//! reformats what the client signed.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attestation::Platform;
use crate::celltower::CellReport;
use crate::error::ProofError;
use crate::gnss::GnssSatellite;
use crate::mesh::TriangleId;

pub const VERSION_V1: &str = "STEP-PROOF-v1";
pub const VERSION_V2: &str = "STEP-PROOF-v2";

/// Strict wire format for timestamps: ISO-8601, milliseconds, UTC `Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const MAX_NONCE_LEN: usize = 128;

// ----------------------------------------------------------------------------
// Wire payloads
// ----------------------------------------------------------------------------

/// A submitted proof, keyed by its `version` field. Any other version string
/// fails deserialization and surfaces as `InvalidPayload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum ProofPayload {
    #[serde(rename = "STEP-PROOF-v1")]
    V1(ProofPayloadV1),
    #[serde(rename = "STEP-PROOF-v2")]
    V2(ProofPayloadV2),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofPayloadV1 {
    pub account: String,
    pub triangle_id: String,
    pub lat: String,
    pub lon: String,
    pub accuracy: String,
    pub timestamp: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofPayloadV2 {
    pub account: String,
    pub triangle_id: String,
    pub location: LocationField,
    pub timestamp: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gnss: Option<GnssReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationField {
    pub lat: String,
    pub lon: String,
    pub accuracy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationField {
    pub platform: Platform,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GnssReport {
    pub satellites: Vec<GnssSatellite>,
}

/// Reserved: scored as zero until the Wi-Fi verifier lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiReport {
    pub aps: Vec<WifiAccessPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiAccessPoint {
    pub bssid: String,
    pub rssi: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

// ----------------------------------------------------------------------------
// Accessors and canonical message
// ----------------------------------------------------------------------------

impl ProofPayload {
    pub fn version_str(&self) -> &'static str {
        match self {
            ProofPayload::V1(_) => VERSION_V1,
            ProofPayload::V2(_) => VERSION_V2,
        }
    }

    pub fn account(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.account,
            ProofPayload::V2(p) => &p.account,
        }
    }

    pub fn triangle_id(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.triangle_id,
            ProofPayload::V2(p) => &p.triangle_id,
        }
    }

    pub fn lat_text(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.lat,
            ProofPayload::V2(p) => &p.location.lat,
        }
    }

    pub fn lon_text(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.lon,
            ProofPayload::V2(p) => &p.location.lon,
        }
    }

    pub fn accuracy_text(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.accuracy,
            ProofPayload::V2(p) => &p.location.accuracy,
        }
    }

    pub fn timestamp_text(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.timestamp,
            ProofPayload::V2(p) => &p.timestamp,
        }
    }

    pub fn nonce(&self) -> &str {
        match self {
            ProofPayload::V1(p) => &p.nonce,
            ProofPayload::V2(p) => &p.nonce,
        }
    }

    pub fn attestation(&self) -> Option<&AttestationField> {
        match self {
            ProofPayload::V1(_) => None,
            ProofPayload::V2(p) => p.attestation.as_ref(),
        }
    }

    pub fn gnss(&self) -> Option<&GnssReport> {
        match self {
            ProofPayload::V1(_) => None,
            ProofPayload::V2(p) => p.gnss.as_ref(),
        }
    }

    pub fn cell(&self) -> Option<&CellReport> {
        match self {
            ProofPayload::V1(_) => None,
            ProofPayload::V2(p) => p.cell.as_ref(),
        }
    }

    pub fn wifi(&self) -> Option<&WifiReport> {
        match self {
            ProofPayload::V1(_) => None,
            ProofPayload::V2(p) => p.wifi.as_ref(),
        }
    }

    /// The byte-exact signable string. Numeric segments are the client's own
    /// text, untouched.
    pub fn canonical_message(&self) -> String {
        format!(
            "{}|account:{}|triangle:{}|lat:{}|lon:{}|acc:{}|ts:{}|nonce:{}",
            self.version_str(),
            self.account(),
            self.triangle_id(),
            self.lat_text(),
            self.lon_text(),
            self.accuracy_text(),
            self.timestamp_text(),
            self.nonce(),
        )
    }

    /// Structural and numeric validation, producing the parsed view the
    /// pipeline works with.
    pub fn validate(&self) -> Result<ValidatedProof, ProofError> {
        if !is_hex_address(self.account()) {
            return Err(ProofError::InvalidPayload(format!(
                "account '{}' is not a 0x-prefixed 20-byte hex address",
                self.account()
            )));
        }

        let nonce = self.nonce();
        if nonce.is_empty() || nonce.len() > MAX_NONCE_LEN {
            return Err(ProofError::InvalidPayload(
                "nonce must be 1..=128 characters".into(),
            ));
        }

        let lat = parse_decimal_text("lat", self.lat_text())?;
        let lon = parse_decimal_text("lon", self.lon_text())?;
        let accuracy_m = parse_decimal_text("accuracy", self.accuracy_text())?;
        if !(-90.0..=90.0).contains(&lat) {
            return Err(ProofError::InvalidPayload(format!("lat {lat} out of range")));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(ProofError::InvalidPayload(format!("lon {lon} out of range")));
        }
        if accuracy_m < 0.0 {
            return Err(ProofError::InvalidPayload("accuracy must be >= 0".into()));
        }

        let timestamp = parse_timestamp(self.timestamp_text())?;

        let triangle = TriangleId::decode(self.triangle_id()).map_err(|e| {
            ProofError::InvalidPayload(format!("triangle id '{}': {e}", self.triangle_id()))
        })?;

        Ok(ValidatedProof {
            account: self.account().to_ascii_lowercase(),
            triangle,
            lat,
            lon,
            accuracy_m,
            timestamp,
            nonce: nonce.to_string(),
        })
    }
}

/// Parsed, range-checked view of a payload.
#[derive(Debug, Clone)]
pub struct ValidatedProof {
    /// Lowercase-normalized claimed account.
    pub account: String,
    pub triangle: TriangleId,
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

fn is_hex_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s.as_bytes()[2..].iter().all(u8::is_ascii_hexdigit)
}

/// Accepts plain decimal text only (optional sign, digits, at most one dot,
/// no exponent) and requires it to parse to a finite `f64`. This is the
/// round-trip guarantee: what the client signed is exactly what we read.
fn parse_decimal_text(field: &str, text: &str) -> Result<f64, ProofError> {
    let bad = |why: &str| ProofError::InvalidPayload(format!("{field} '{text}' {why}"));

    let body = text.strip_prefix('-').unwrap_or(text);
    if body.is_empty() {
        return Err(bad("is empty"));
    }
    let mut dots = 0usize;
    for ch in body.chars() {
        match ch {
            '0'..='9' => {}
            '.' => dots += 1,
            _ => return Err(bad("is not plain decimal text")),
        }
    }
    if dots > 1 || body.starts_with('.') || body.ends_with('.') {
        return Err(bad("is not plain decimal text"));
    }

    let value: f64 = text.parse().map_err(|_| bad("does not parse"))?;
    if !value.is_finite() {
        return Err(bad("is not finite"));
    }
    Ok(value)
}

/// Strict ISO-8601 milliseconds UTC, trailing `Z`.
///
/// The shape is checked up front because chrono's `%.3f` tolerates a missing
/// fraction when parsing; the wire format requires exactly three digits.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ProofError> {
    let bad = || {
        ProofError::InvalidPayload(format!(
            "timestamp '{text}' is not ISO-8601 milliseconds UTC"
        ))
    };

    let bytes = text.as_bytes();
    if bytes.len() != 24 || bytes[10] != b'T' || bytes[19] != b'.' || bytes[23] != b'Z' {
        return Err(bad());
    }
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| bad())
}

/// Formats a timestamp in the wire format.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
