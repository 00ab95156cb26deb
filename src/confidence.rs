//! Multi-signal confidence scoring.
//!
//! Nine weighted anti-spoof signals aggregate into an integer score on a
//! 0–110 scale (the witness bonus can push past 100). The decision is a
//! plain threshold compare; the band label is a pure function of the total.

use serde::{Deserialize, Serialize};

/// The nine signal weights plus the acceptance cut-off. Defaults ship in
/// code; deployments override through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringWeights {
    pub signature: u32,
    pub gps_accuracy: u32,
    pub speed: u32,
    pub moratorium: u32,
    pub attestation: u32,
    pub gnss: u32,
    pub cell_tower: u32,
    pub wifi: u32,
    pub witness: u32,
    pub acceptance_threshold: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            signature: 20,
            gps_accuracy: 15,
            speed: 10,
            moratorium: 5,
            attestation: 25,
            gnss: 15,
            cell_tower: 10,
            wifi: 10,
            witness: 10,
            acceptance_threshold: 70,
        }
    }
}

/// Points awarded per signal for one proof.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalScores {
    pub signature: u32,
    pub gps_accuracy: u32,
    pub speed: u32,
    pub moratorium: u32,
    pub attestation: u32,
    pub gnss: u32,
    pub cell_tower: u32,
    pub wifi: u32,
    pub witness: u32,
}

impl SignalScores {
    pub fn total(&self) -> u32 {
        self.signature
            + self.gps_accuracy
            + self.speed
            + self.moratorium
            + self.attestation
            + self.gnss
            + self.cell_tower
            + self.wifi
            + self.witness
    }
}

/// Confidence band; the label is what clients display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    FraudLikely,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_total(total: u32) -> Self {
        match total {
            0..=49 => ConfidenceLevel::FraudLikely,
            50..=69 => ConfidenceLevel::Low,
            70..=84 => ConfidenceLevel::Moderate,
            85..=94 => ConfidenceLevel::High,
            _ => ConfidenceLevel::VeryHigh,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceLevel::FraudLikely => "Fraud Likely",
            ConfidenceLevel::Low => "Low Confidence",
            ConfidenceLevel::Moderate => "Moderate Confidence",
            ConfidenceLevel::High => "High Confidence",
            ConfidenceLevel::VeryHigh => "Very High Confidence",
        }
    }
}

impl Serialize for ConfidenceLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Outcome of aggregation: total, band, accept/reject, and one reason line
/// per shortfall signal when rejected.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceDecision {
    pub total: u32,
    pub accepted: bool,
    pub level: ConfidenceLevel,
    pub reasons: Vec<String>,
}

/// Aggregates the signal scores into an acceptance decision.
pub fn evaluate(scores: &SignalScores, weights: &ScoringWeights) -> ConfidenceDecision {
    let total = scores.total();
    let accepted = total >= weights.acceptance_threshold;
    let level = ConfidenceLevel::from_total(total);

    let mut reasons = Vec::new();
    if !accepted {
        // One line per underperforming signal; the reserved wifi/witness
        // signals never produce a line.
        let shortfalls: [(&str, u32, u32); 7] = [
            ("signature", scores.signature, weights.signature),
            ("gps accuracy", scores.gps_accuracy, weights.gps_accuracy),
            ("speed gate", scores.speed, weights.speed),
            ("moratorium", scores.moratorium, weights.moratorium),
            ("attestation", scores.attestation, weights.attestation),
            ("gnss raw", scores.gnss, weights.gnss),
            ("cell tower", scores.cell_tower, weights.cell_tower),
        ];
        for (name, got, max) in shortfalls {
            if got < max {
                reasons.push(format!("{name}: scored {got} of {max}"));
            }
        }
        reasons.push(format!(
            "total confidence {total} is below the acceptance threshold {}",
            weights.acceptance_threshold
        ));
    }

    ConfidenceDecision {
        total,
        accepted,
        level,
        reasons,
    }
}
