//! GNSS raw-measurement plausibility scoring.
//!
//! Spoofed fixes tend to ship synthetic satellite tables: too few birds, one
//! constellation, implausibly flat signal strengths, lattice-regular
//! elevations. Each check claims a bounded share of a 15-point budget;
//! missing data scores zero and is never a rejection (one platform does not
//! expose raw GNSS at all).

use serde::{Deserialize, Serialize};

/// Total points available to the GNSS signal.
pub const GNSS_BUDGET: u32 = 15;

const SAT_COUNT_POINTS: u32 = 4;
const CONSTELLATION_POINTS: u32 = 3;
const VARIANCE_POINTS: u32 = 3;
const MEAN_POINTS: u32 = 3;
const ELEVATION_POINTS: u32 = 2;

const MIN_SATELLITES: usize = 4;
const MIN_CONSTELLATIONS: usize = 2;
/// Real antennas see several dB-Hz² of C/N0 spread; simulators are flatter.
const MIN_CN0_VARIANCE: f64 = 5.0;
const MEAN_CN0_RANGE: (f64, f64) = (30.0, 50.0);
/// Minimum standard deviation of elevations before the sky view counts as
/// plausibly scattered.
const MIN_ELEVATION_STDDEV: f64 = 2.0;
/// Minimum variance of consecutive elevation gaps; a near-zero value means
/// the satellites sit on a regular lattice.
const MIN_ELEVATION_GAP_VARIANCE: f64 = 1.0;

/// One raw satellite measurement as reported by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GnssSatellite {
    pub svid: u32,
    pub cn0_db_hz: f64,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub constellation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GnssCheck {
    pub name: &'static str,
    pub passed: bool,
}

/// Outcome of the GNSS sub-checks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GnssAssessment {
    pub points: u32,
    pub checks: Vec<GnssCheck>,
}

impl GnssAssessment {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Scores a satellite table against the five plausibility checks.
pub fn assess(satellites: &[GnssSatellite]) -> GnssAssessment {
    if satellites.is_empty() {
        return GnssAssessment {
            points: 0,
            checks: vec![
                GnssCheck { name: "satellite-count", passed: false },
                GnssCheck { name: "constellation-diversity", passed: false },
                GnssCheck { name: "cn0-variance", passed: false },
                GnssCheck { name: "cn0-mean", passed: false },
                GnssCheck { name: "elevation-spread", passed: false },
            ],
        };
    }

    let cn0: Vec<f64> = satellites.iter().map(|s| s.cn0_db_hz).collect();
    let elevations: Vec<f64> = satellites.iter().map(|s| s.elevation_deg).collect();

    let count_ok = satellites.len() >= MIN_SATELLITES;

    let mut constellations: Vec<&str> =
        satellites.iter().map(|s| s.constellation.as_str()).collect();
    constellations.sort_unstable();
    constellations.dedup();
    let constellations_ok = constellations.len() >= MIN_CONSTELLATIONS;

    let variance_ok = variance(&cn0) > MIN_CN0_VARIANCE;

    let cn0_mean = mean(&cn0);
    let mean_ok = (MEAN_CN0_RANGE.0..=MEAN_CN0_RANGE.1).contains(&cn0_mean);

    let elevation_ok = elevation_spread_ok(&elevations);

    let checks = vec![
        GnssCheck { name: "satellite-count", passed: count_ok },
        GnssCheck { name: "constellation-diversity", passed: constellations_ok },
        GnssCheck { name: "cn0-variance", passed: variance_ok },
        GnssCheck { name: "cn0-mean", passed: mean_ok },
        GnssCheck { name: "elevation-spread", passed: elevation_ok },
    ];

    let points = [
        (count_ok, SAT_COUNT_POINTS),
        (constellations_ok, CONSTELLATION_POINTS),
        (variance_ok, VARIANCE_POINTS),
        (mean_ok, MEAN_POINTS),
        (elevation_ok, ELEVATION_POINTS),
    ]
    .iter()
    .filter(|(ok, _)| *ok)
    .map(|(_, p)| p)
    .sum();

    GnssAssessment { points, checks }
}

/// Real sky views scatter elevations; a degenerate table bunches them or
/// spaces them on an exact lattice.
fn elevation_spread_ok(elevations: &[f64]) -> bool {
    if elevations.len() < 2 {
        return false;
    }
    if variance(elevations).sqrt() < MIN_ELEVATION_STDDEV {
        return false;
    }
    if elevations.len() >= 4 {
        let mut sorted = elevations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let gaps: Vec<f64> = sorted.windows(2).map(|w| w[1] - w[0]).collect();
        if variance(&gaps) < MIN_ELEVATION_GAP_VARIANCE {
            return false;
        }
    }
    true
}
