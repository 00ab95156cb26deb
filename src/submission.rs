//! Proof-submission orchestrator.
//!
//! Drives one proof through the full pipeline: structural validation, the
//! cheap gates, signature recovery, replay pre-check, geometry, the
//! per-account heuristics, the external verifiers, confidence aggregation
//! and finally the atomic store commit. Gates short-circuit with their own
//! error kind; verifier transport failures degrade to zero points.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::attestation::{AttestationVerdict, DeviceAttestor};
use crate::celltower::CellLocator;
use crate::config::Config;
use crate::confidence::{self, ConfidenceLevel, ScoringWeights, SignalScores};
use crate::crypto;
use crate::error::ProofError;
use crate::geometry::GeoPoint;
use crate::gnss;
use crate::heuristics::{self, PreviousFix};
use crate::persistence::{ClickCommit, EventRecord, Store, TriangleState};
use crate::proof::{format_timestamp, parse_timestamp, ProofPayload, ValidatedProof};
use crate::reward;

/// Ceiling on one attestation verifier round-trip, over and above the
/// verifier's own HTTP timeout.
const ATTESTOR_DEADLINE: Duration = Duration::from_millis(600);

/// Successful submission response (flat wire shape).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofAccepted {
    pub reward: String,
    pub unit: &'static str,
    pub triangle_id: String,
    pub level: u8,
    pub clicks: u32,
    /// Balance in STEP, six decimals.
    pub balance: String,
    pub balance_micro: u64,
    pub confidence: u32,
    pub confidence_level: ConfidenceLevel,
    pub scores: SignalScores,
    pub processed_at: String,
}

/// The validator service: stateless per request, shared across them.
pub struct ProofService {
    store: Arc<Store>,
    attestor: Arc<dyn DeviceAttestor>,
    cell: Arc<CellLocator>,
    config: Arc<Config>,
    weights: ScoringWeights,
}

impl ProofService {
    pub fn new(
        store: Arc<Store>,
        attestor: Arc<dyn DeviceAttestor>,
        cell: Arc<CellLocator>,
        config: Arc<Config>,
    ) -> Self {
        let weights = config.weights();
        ProofService {
            store,
            attestor,
            cell,
            config,
            weights,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Validates and commits one proof.
    pub async fn submit(
        &self,
        payload_json: serde_json::Value,
        signature: &str,
    ) -> Result<ProofAccepted, ProofError> {
        let received_at = Utc::now();

        // 1. Structural validation.
        let payload: ProofPayload = serde_json::from_value(payload_json)
            .map_err(|e| ProofError::InvalidPayload(e.to_string()))?;
        let validated = payload.validate()?;

        // 2. Accuracy gate, before any expensive work.
        heuristics::check_accuracy(validated.accuracy_m, self.config.gps_max_accuracy_m)?;

        // 3. Signature recovery and address match.
        let signature_bytes =
            crypto::parse_signature_hex(signature).map_err(ProofError::BadSignature)?;
        let message = payload.canonical_message();
        let account =
            crypto::verify_account(message.as_bytes(), &signature_bytes, &validated.account)?;

        // 4. Nonce pre-check (the unique index remains the real guard).
        if self.store.has_nonce(&account, &validated.nonce)? {
            return Err(ProofError::NonceReplay);
        }

        // 5. Triangle fetch. Missing cells are an error, never synthesized.
        let triangle = self
            .store
            .triangle(&validated.triangle)?
            .ok_or_else(|| ProofError::TriangleNotFound(validated.triangle.to_string()))?;
        if triangle.state != TriangleState::Active {
            return Err(ProofError::TriangleNotFound(format!(
                "{} is subdivided; click its children",
                triangle.id
            )));
        }

        // 6. Geometry gate.
        if !validated.triangle.contains(validated.lat, validated.lon)? {
            return Err(ProofError::OutOfBounds {
                triangle: triangle.id.to_string(),
            });
        }

        // 7. Most recent prior click by this account.
        let prior = self.store.latest_click(&account)?;

        // 8. Speed, then moratorium.
        let position = GeoPoint::new(validated.lat, validated.lon);
        let mut speed_mps = None;
        if let Some(previous) = &prior {
            let previous_fix = previous_fix_of(previous)?;
            speed_mps = heuristics::check_speed(
                &previous_fix,
                &position,
                &validated.timestamp,
                self.config.proof_speed_limit_mps,
            )?;
            heuristics::check_moratorium(
                &received_at,
                &previous_fix.recorded_at,
                self.config.proof_moratorium_ms,
            )?;
        }

        // 9. External verifiers, overlapped.
        let (attestation_points, gnss_points, cell_points) =
            self.verifier_scores(&payload, &validated, &position).await?;

        // 10. Confidence aggregation. Surviving a gate earns that signal's
        // full weight.
        let scores = SignalScores {
            signature: self.weights.signature,
            gps_accuracy: self.weights.gps_accuracy,
            speed: self.weights.speed,
            moratorium: self.weights.moratorium,
            attestation: attestation_points,
            gnss: gnss_points,
            cell_tower: cell_points,
            wifi: 0,
            witness: 0,
        };
        let decision = confidence::evaluate(&scores, &self.weights);
        if !decision.accepted {
            return Err(ProofError::LowConfidence {
                confidence: decision.total,
                reasons: decision.reasons,
            });
        }

        // 11. Reward.
        let reward_micro = reward::micro_step_for_level(triangle.level);

        // 12. Atomic commit: event + triangle + balance, or nothing.
        let outcome = self.store.commit_click(&ClickCommit {
            triangle_id: &triangle.id,
            account: &account,
            nonce: &validated.nonce,
            signature_hex: signature,
            reward_micro,
            received_at,
            lat: validated.lat,
            lon: validated.lon,
            accuracy_m: validated.accuracy_m,
            client_timestamp: validated.timestamp,
            speed_mps,
        })?;

        if let Some(children) = &outcome.children {
            info!(
                triangle = %triangle.id,
                level = triangle.level,
                children = ?children.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                "triangle fully clicked; subdivided"
            );
        }

        // 13. Response.
        Ok(ProofAccepted {
            reward: reward::format_step(reward_micro),
            unit: "STEP",
            triangle_id: triangle.id.to_string(),
            level: triangle.level,
            clicks: outcome.clicks,
            balance: reward::format_step(outcome.balance_micro),
            balance_micro: outcome.balance_micro,
            confidence: decision.total,
            confidence_level: decision.level,
            scores,
            processed_at: format_timestamp(&received_at),
        })
    }

    /// Runs the attestation and cell-tower verifiers concurrently; GNSS is
    /// pure and scored inline. Only the attestation-required policy can fail
    /// the request here.
    async fn verifier_scores(
        &self,
        payload: &ProofPayload,
        validated: &ValidatedProof,
        position: &GeoPoint,
    ) -> Result<(u32, u32, u32), ProofError> {
        let gnss_points = payload
            .gnss()
            .map(|report| gnss::assess(&report.satellites).points)
            .unwrap_or(0);

        let attestation_future = self.attestation_points(payload, validated);
        let cell_future = async {
            match payload.cell() {
                Some(cell) => self.cell.score(cell, position).await.0,
                None => 0,
            }
        };
        let (attestation_points, cell_points) = tokio::join!(attestation_future, cell_future);

        Ok((attestation_points?, gnss_points, cell_points))
    }

    async fn attestation_points(
        &self,
        payload: &ProofPayload,
        validated: &ValidatedProof,
    ) -> Result<u32, ProofError> {
        let field = match payload.attestation() {
            Some(field) => field,
            None => {
                if self.config.require_attestation {
                    return Err(ProofError::AttestationRequired);
                }
                return Ok(0);
            }
        };

        let expected_app_id = match self.config.expected_app_id(field.platform) {
            Some(app_id) => app_id,
            None => {
                if self.config.require_attestation {
                    return Err(ProofError::AttestationFailed(format!(
                        "no expected app id configured for {}",
                        field.platform.as_str()
                    )));
                }
                warn!(
                    platform = field.platform.as_str(),
                    "attestation token supplied but no app id configured; scoring zero"
                );
                return Ok(0);
            }
        };

        let verdict = tokio::time::timeout(
            ATTESTOR_DEADLINE,
            self.attestor
                .verify(&field.token, field.platform, expected_app_id, &validated.nonce),
        )
        .await;

        match verdict {
            Ok(Ok(AttestationVerdict { passed: true, .. })) => Ok(self.weights.attestation),
            Ok(Ok(AttestationVerdict { reason, .. })) => {
                info!(
                    platform = field.platform.as_str(),
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "attestation verdict failed; scoring zero"
                );
                Ok(0)
            }
            Ok(Err(e)) => {
                // Transport or service trouble is not the miner's fault.
                warn!(error = %e, "attestation verifier unavailable; scoring zero");
                Ok(0)
            }
            Err(_) => {
                warn!("attestation verifier timed out; scoring zero");
                Ok(0)
            }
        }
    }
}

/// Rebuilds the previous fix from a stored click event.
fn previous_fix_of(event: &EventRecord) -> Result<PreviousFix, ProofError> {
    let lat = event.payload["lat"].as_f64();
    let lon = event.payload["lon"].as_f64();
    let client_ts = event.payload["clientTimestamp"].as_str();
    match (lat, lon, client_ts) {
        (Some(lat), Some(lon), Some(ts)) => Ok(PreviousFix {
            position: GeoPoint::new(lat, lon),
            client_timestamp: parse_timestamp(ts)
                .map_err(|_| ProofError::InternalError("bad stored clientTimestamp".into()))?,
            recorded_at: event.at,
        }),
        _ => Err(ProofError::InternalError(
            "stored click event is missing position fields".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{Platform, StaticAttestor};
    use crate::mesh::{self, TriangleId};
    use crate::persistence::{TriangleRecord, SUBDIVISION_CLICKS};
    use crate::proof::{
        AttestationField, LocationField, ProofPayloadV1, ProofPayloadV2,
    };
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use secp256k1::SecretKey;

    const LAT: f64 = 47.4979;
    const LON: f64 = 19.0402;

    fn secret() -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = 99;
        bytes[1] = 3;
        SecretKey::from_slice(&bytes).unwrap()
    }

    fn service_with(config: Config, attestation_passes: bool) -> (ProofService, TriangleId) {
        let store = Store::in_memory().unwrap();
        store.ensure_face_triangles().unwrap();
        let id = mesh::locate(LAT, LON, 10).unwrap();
        // Materialize the level-10 target cell directly.
        store
            .insert_triangle_record(&TriangleRecord::new_active(id.clone(), Utc::now()))
            .unwrap();
        let service = ProofService::new(
            Arc::new(store),
            Arc::new(StaticAttestor {
                passed: attestation_passes,
            }),
            Arc::new(CellLocator::disabled()),
            Arc::new(config),
        );
        (service, id)
    }

    fn lenient_config() -> Config {
        Config {
            acceptance_threshold: 50,
            proof_moratorium_ms: 0,
            ..Config::default()
        }
    }

    fn v1_payload(id: &TriangleId, nonce: &str, ts: DateTime<Utc>) -> ProofPayload {
        ProofPayload::V1(ProofPayloadV1 {
            account: crypto::address_for_secret(&secret()),
            triangle_id: id.to_string(),
            lat: LAT.to_string(),
            lon: LON.to_string(),
            accuracy: "12.5".to_string(),
            timestamp: format_timestamp(&ts),
            nonce: nonce.to_string(),
        })
    }

    fn v2_payload(id: &TriangleId, nonce: &str) -> ProofPayload {
        ProofPayload::V2(ProofPayloadV2 {
            account: crypto::address_for_secret(&secret()),
            triangle_id: id.to_string(),
            location: LocationField {
                lat: LAT.to_string(),
                lon: LON.to_string(),
                accuracy: "12.5".to_string(),
            },
            timestamp: format_timestamp(&Utc::now()),
            nonce: nonce.to_string(),
            attestation: Some(AttestationField {
                platform: Platform::Android,
                token: "token".to_string(),
            }),
            gnss: None,
            cell: None,
            wifi: None,
            device: None,
        })
    }

    fn signed(payload: &ProofPayload) -> (serde_json::Value, String) {
        let sig = crypto::sign_message(payload.canonical_message().as_bytes(), &secret());
        (
            serde_json::to_value(payload).unwrap(),
            format!("0x{}", hex::encode(sig)),
        )
    }

    async fn submit(
        service: &ProofService,
        payload: &ProofPayload,
    ) -> Result<ProofAccepted, ProofError> {
        let (json, sig) = signed(payload);
        service.submit(json, &sig).await
    }

    #[tokio::test]
    async fn test_accept_valid_v2_proof() {
        let config = Config {
            android_package_name: Some("network.step.mobile".into()),
            proof_moratorium_ms: 0,
            ..Config::default()
        };
        let (service, id) = service_with(config, true);

        let accepted = submit(&service, &v2_payload(&id, "n1")).await.unwrap();
        assert_eq!(accepted.unit, "STEP");
        assert_eq!(accepted.level, 10);
        assert_eq!(accepted.clicks, 1);
        assert_eq!(accepted.reward, "0.001953");
        assert_eq!(accepted.balance_micro, 1_953);
        // signature 20 + accuracy 15 + speed 10 + moratorium 5 + attestation 25.
        assert_eq!(accepted.confidence, 75);
        assert!(accepted.confidence >= 70);
        assert_eq!(accepted.scores.attestation, 25);
    }

    #[tokio::test]
    async fn test_replay_rejected_and_single_event() {
        let (service, id) = service_with(lenient_config(), true);
        let payload = v1_payload(&id, "replayed", Utc::now());

        submit(&service, &payload).await.unwrap();
        let err = submit(&service, &payload).await.unwrap_err();
        assert_eq!(err.code(), "NonceReplay");

        let account = crypto::address_for_secret(&secret());
        assert_eq!(service.store().event_count(&account, "replayed").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accuracy_gate_rejects_without_writes() {
        let (service, id) = service_with(lenient_config(), true);
        let mut payload = v1_payload(&id, "acc", Utc::now());
        if let ProofPayload::V1(p) = &mut payload {
            p.accuracy = "75".into();
        }
        let err = submit(&service, &payload).await.unwrap_err();
        assert_eq!(err.code(), "LowGpsAccuracy");

        let account = crypto::address_for_secret(&secret());
        assert_eq!(service.store().event_count(&account, "acc").unwrap(), 0);
        assert_eq!(service.store().account_balance_micro(&account).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let (service, id) = service_with(lenient_config(), true);
        let payload = v1_payload(&id, "sig", Utc::now());
        let (json, _) = signed(&payload);

        // Signature over a different message recovers a different signer.
        let other = crypto::sign_message(b"something else", &secret());
        let err = service
            .submit(json, &format!("0x{}", hex::encode(other)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BadSignature");
    }

    #[tokio::test]
    async fn test_unknown_triangle_not_synthesized() {
        let (service, _) = service_with(lenient_config(), true);
        // A valid id the store never materialized.
        let elsewhere = mesh::locate(-33.8688, 151.2093, 10).unwrap();
        let err = submit(&service, &v1_payload(&elsewhere, "t", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TriangleNotFound");
    }

    #[tokio::test]
    async fn test_out_of_bounds_position() {
        let (service, id) = service_with(lenient_config(), true);
        let mut payload = v1_payload(&id, "oob", Utc::now());
        if let ProofPayload::V1(p) = &mut payload {
            // Budapest triangle, Sydney coordinates.
            p.lat = "-33.8688".into();
            p.lon = "151.2093".into();
        }
        let err = submit(&service, &payload).await.unwrap_err();
        assert_eq!(err.code(), "OutOfBounds");
    }

    #[tokio::test]
    async fn test_speed_gate_across_two_proofs() {
        let (service, id) = service_with(lenient_config(), true);
        let first_ts = Utc::now() - ChronoDuration::seconds(5);
        submit(&service, &v1_payload(&id, "s1", first_ts)).await.unwrap();

        // ~150 km north five seconds later, against that cell's own triangle
        // so only the speed gate can object.
        let far = mesh::locate(48.85, LON, 10).unwrap();
        service
            .store()
            .insert_triangle_record(&TriangleRecord::new_active(far.clone(), Utc::now()))
            .unwrap();
        let mut second = v1_payload(&far, "s2", Utc::now());
        if let ProofPayload::V1(p) = &mut second {
            p.lat = "48.85".into();
        }
        let err = submit(&service, &second).await.unwrap_err();
        assert_eq!(err.code(), "TooFast");
    }

    #[tokio::test]
    async fn test_moratorium_uses_server_clock() {
        let config = Config {
            acceptance_threshold: 50,
            // Default ten-second moratorium stays on.
            ..Config::default()
        };
        let (service, id) = service_with(config, true);

        // Client timestamps one hour apart cannot defeat the gate: both
        // proofs arrive within milliseconds of each other.
        let first_ts = Utc::now() - ChronoDuration::hours(1);
        submit(&service, &v1_payload(&id, "m1", first_ts)).await.unwrap();
        let err = submit(&service, &v1_payload(&id, "m2", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Moratorium");
    }

    #[tokio::test]
    async fn test_low_confidence_lists_reasons() {
        // Default threshold 70; a bare v1 proof scores 50.
        let config = Config {
            proof_moratorium_ms: 0,
            ..Config::default()
        };
        let (service, id) = service_with(config, true);
        let err = submit(&service, &v1_payload(&id, "lc", Utc::now()))
            .await
            .unwrap_err();
        match err {
            ProofError::LowConfidence { confidence, reasons } => {
                assert_eq!(confidence, 50);
                assert!(!reasons.is_empty());
                assert!(reasons.iter().any(|r| r.contains("attestation")));
            }
            other => panic!("expected LowConfidence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attestation_required_when_token_absent() {
        let config = Config {
            require_attestation: true,
            android_package_name: Some("network.step.mobile".into()),
            proof_moratorium_ms: 0,
            ..Config::default()
        };
        let (service, id) = service_with(config, true);
        let err = submit(&service, &v1_payload(&id, "ar", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AttestationRequired");
    }

    #[tokio::test]
    async fn test_failing_attestation_scores_zero_and_rejects() {
        let config = Config {
            require_attestation: true,
            android_package_name: Some("network.step.mobile".into()),
            proof_moratorium_ms: 0,
            ..Config::default()
        };
        // Token present but the platform verdict fails.
        let (service, id) = service_with(config, false);
        let err = submit(&service, &v2_payload(&id, "af")).await.unwrap_err();
        match err {
            ProofError::LowConfidence { confidence, .. } => assert_eq!(confidence, 50),
            other => panic!("expected LowConfidence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subdivision_end_to_end() {
        let (service, id) = service_with(lenient_config(), true);

        for i in 1..SUBDIVISION_CLICKS {
            let accepted = submit(&service, &v1_payload(&id, &format!("sub{i}"), Utc::now()))
                .await
                .unwrap();
            assert_eq!(accepted.clicks, i);
        }
        let last = submit(&service, &v1_payload(&id, "sub11", Utc::now()))
            .await
            .unwrap();
        assert_eq!(last.clicks, SUBDIVISION_CLICKS);
        assert_eq!(last.balance_micro, 1_953 * u64::from(SUBDIVISION_CLICKS));

        let record = service.store().triangle(&id).unwrap().unwrap();
        assert_eq!(record.children.len(), 4);
        let events = service.store().subdivide_events(&id.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].account, "system");

        // The parent is retired now.
        let err = submit(&service, &v1_payload(&id, "sub12", Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TriangleNotFound");
    }

    #[tokio::test]
    async fn test_invalid_payload_shape() {
        let (service, _) = service_with(lenient_config(), true);
        let err = service
            .submit(serde_json::json!({ "version": "nope" }), "0x00")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPayload");
    }
}
