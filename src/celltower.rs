//! Cell-tower location cross-check.
//!
//! The reported serving cell is resolved to known tower coordinates through
//! an external lookup service (a free community database first, a keyed
//! commercial one as fallback) and the distance between the tower and the
//! reported GPS fix is scored in buckets. Lookup failures degrade to zero
//! points; they never reject a proof.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::geometry::{haversine_m, GeoPoint};

/// Total points available to the cell-tower signal.
pub const CELL_BUDGET: u32 = 10;

/// Per-call timeout for tower lookups.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_millis(400);

/// Serving-cell observation as reported by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellReport {
    pub mcc: u16,
    pub mnc: u16,
    pub cell_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tac: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<Vec<NeighborCell>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborCell {
    pub cell_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrp: Option<f64>,
}

#[derive(Error, Debug)]
pub enum CellLookupError {
    #[error("cell lookup transport error: {0}")]
    Transport(String),
    #[error("cell not present in any tower database")]
    NotFound,
    #[error("cell lookup returned an unusable response: {0}")]
    BadResponse(String),
    #[error("cell lookup is not configured")]
    Disabled,
}

/// Distance buckets: a serving tower more than 50 km from the reported fix
/// is a strong spoofing signal and earns nothing.
pub fn score_distance_m(distance_m: f64) -> u32 {
    if distance_m < 10_000.0 {
        10
    } else if distance_m < 25_000.0 {
        7
    } else if distance_m < 50_000.0 {
        4
    } else {
        0
    }
}

#[derive(Debug, Deserialize)]
struct TowerLocation {
    lat: f64,
    lon: f64,
}

/// Resolves serving cells to tower coordinates.
pub struct CellLocator {
    client: Client,
    primary_url: Option<String>,
    fallback_url: Option<String>,
    fallback_key: Option<String>,
}

impl CellLocator {
    pub fn new(
        primary_url: Option<String>,
        fallback_url: Option<String>,
        fallback_key: Option<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        CellLocator {
            client,
            primary_url,
            fallback_url,
            fallback_key,
        }
    }

    /// A locator with no endpoints; every lookup yields `Disabled`.
    pub fn disabled() -> Self {
        Self::new(None, None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.primary_url.is_some() || self.fallback_url.is_some()
    }

    /// Looks up the tower position, trying the free database first.
    pub async fn locate(&self, cell: &CellReport) -> Result<GeoPoint, CellLookupError> {
        if !self.is_enabled() {
            return Err(CellLookupError::Disabled);
        }

        let mut last_err = CellLookupError::NotFound;
        if let Some(url) = &self.primary_url {
            match self.query(url, cell, None).await {
                Ok(point) => return Ok(point),
                Err(e) => last_err = e,
            }
        }
        if let Some(url) = &self.fallback_url {
            match self.query(url, cell, self.fallback_key.as_deref()).await {
                Ok(point) => return Ok(point),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn query(
        &self,
        url: &str,
        cell: &CellReport,
        key: Option<&str>,
    ) -> Result<GeoPoint, CellLookupError> {
        let mut request = self.client.get(url).query(&[
            ("mcc", cell.mcc.to_string()),
            ("mnc", cell.mnc.to_string()),
            ("cellid", cell.cell_id.to_string()),
        ]);
        if let Some(tac) = cell.tac {
            request = request.query(&[("tac", tac.to_string())]);
        }
        if let Some(key) = key {
            request = request.query(&[("key", key)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CellLookupError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CellLookupError::NotFound);
        }
        if !response.status().is_success() {
            return Err(CellLookupError::BadResponse(format!(
                "status {}",
                response.status()
            )));
        }

        let tower: TowerLocation = response
            .json()
            .await
            .map_err(|e| CellLookupError::BadResponse(e.to_string()))?;

        let point = GeoPoint::new(tower.lat, tower.lon);
        if !point.is_valid() {
            return Err(CellLookupError::BadResponse(format!(
                "tower position out of range: {}, {}",
                tower.lat, tower.lon
            )));
        }
        Ok(point)
    }

    /// Full cross-check: points plus the tower distance when resolvable.
    /// Failures are logged and score zero.
    pub async fn score(&self, cell: &CellReport, reported: &GeoPoint) -> (u32, Option<f64>) {
        match self.locate(cell).await {
            Ok(tower) => {
                let distance_m = haversine_m(&tower, reported);
                (score_distance_m(distance_m), Some(distance_m))
            }
            Err(CellLookupError::Disabled) => (0, None),
            Err(e) => {
                warn!(
                    mcc = cell.mcc,
                    mnc = cell.mnc,
                    cell_id = cell.cell_id,
                    error = %e,
                    "cell tower lookup failed; scoring zero"
                );
                (0, None)
            }
        }
    }
}
