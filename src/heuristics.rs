//! Anti-spoof gates: GPS accuracy, implied speed, per-account moratorium.

use chrono::{DateTime, Utc};

use crate::error::ProofError;
use crate::geometry::{haversine_m, GeoPoint};

/// Negative client-timestamp deltas within this window are attributed to
/// clock drift; beyond it the pair of fixes is rejected outright.
pub const CLOCK_DRIFT_TOLERANCE_MS: i64 = 120_000;

/// Rejects fixes whose reported GPS accuracy radius is worse than the limit.
pub fn check_accuracy(accuracy_m: f64, max_m: f64) -> Result<(), ProofError> {
    if accuracy_m > max_m {
        return Err(ProofError::LowGpsAccuracy {
            accuracy_m,
            max_m,
        });
    }
    Ok(())
}

/// The account's most recent accepted fix, as needed by the speed and
/// moratorium gates.
#[derive(Debug, Clone)]
pub struct PreviousFix {
    pub position: GeoPoint,
    /// Client-reported capture time (speed gate input).
    pub client_timestamp: DateTime<Utc>,
    /// Server arrival time of that proof (moratorium gate input).
    pub recorded_at: DateTime<Utc>,
}

/// Great-circle speed implied by two client-timestamped fixes.
///
/// Returns `Ok(None)` when no usable movement time elapsed: a non-positive
/// delta inside the drift window is clamped to zero and the speed cannot be
/// inferred. A delta more than the drift window into the past is a rewound
/// clock and fails the gate.
pub fn check_speed(
    prev: &PreviousFix,
    current_position: &GeoPoint,
    current_timestamp: &DateTime<Utc>,
    limit_mps: f64,
) -> Result<Option<f64>, ProofError> {
    let delta_ms = (*current_timestamp - prev.client_timestamp).num_milliseconds();
    if delta_ms <= 0 {
        if delta_ms >= -CLOCK_DRIFT_TOLERANCE_MS {
            return Ok(None);
        }
        return Err(ProofError::TooFast {
            speed_mps: f64::INFINITY,
            limit_mps,
        });
    }

    let distance_m = haversine_m(&prev.position, current_position);
    let speed_mps = distance_m / (delta_ms as f64 / 1000.0);
    if speed_mps > limit_mps {
        return Err(ProofError::TooFast {
            speed_mps,
            limit_mps,
        });
    }
    Ok(Some(speed_mps))
}

/// Enforces the minimum inter-proof interval for one account.
///
/// Compares server-observed times only: the arrival time of this request
/// against the stored arrival time of the account's previous click. Client
/// timestamps cannot shorten the interval.
pub fn check_moratorium(
    server_now: &DateTime<Utc>,
    previous_recorded_at: &DateTime<Utc>,
    min_interval_ms: u64,
) -> Result<(), ProofError> {
    let elapsed_ms = (*server_now - *previous_recorded_at).num_milliseconds();
    if elapsed_ms < min_interval_ms as i64 {
        return Err(ProofError::Moratorium {
            elapsed_ms,
            min_ms: min_interval_ms,
        });
    }
    Ok(())
}
