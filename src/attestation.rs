//! Platform attestation verifiers.
//!
//! Token issuance is the platform vendor's business; the pipeline only
//! consumes verdicts through the [`DeviceAttestor`] seam. Two verifiers are
//! built in: a Play-Integrity-style signed JWT for Android and an opaque
//! App-Attest-style token validated against the vendor service for iOS.
//! Transport failures are recoverable: the scorer awards zero attestation
//! points and the proof continues.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::proof::parse_timestamp;

/// Per-call timeout for vendor round-trips.
pub const ATTESTATION_TIMEOUT: Duration = Duration::from_millis(500);
/// Vendor signing keys are rotated rarely; an hour of caching is plenty.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Freshness window for the embedded challenge, in seconds.
const CHALLENGE_WINDOW_SECS: i64 = 300;

const ALLOWED_DEVICE_VERDICTS: [&str; 2] = ["MEETS_DEVICE_INTEGRITY", "MEETS_STRONG_INTEGRITY"];
const ALLOWED_APP_VERDICT: &str = "PLAY_RECOGNIZED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

/// Verdict returned to the scorer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationVerdict {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub platform: Platform,
    pub verified_at: DateTime<Utc>,
}

impl AttestationVerdict {
    fn pass(platform: Platform) -> Self {
        AttestationVerdict {
            passed: true,
            reason: None,
            platform,
            verified_at: Utc::now(),
        }
    }

    fn fail(platform: Platform, reason: impl Into<String>) -> Self {
        AttestationVerdict {
            passed: false,
            reason: Some(reason.into()),
            platform,
            verified_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AttestError {
    #[error("attestation transport error: {0}")]
    Transport(String),
    #[error("attestation service error: {0}")]
    Service(String),
    #[error("attestation misconfigured: {0}")]
    Config(String),
}

/// Pluggable verifier seam consumed by the orchestrator.
#[async_trait]
pub trait DeviceAttestor: Send + Sync {
    async fn verify(
        &self,
        token: &str,
        platform: Platform,
        expected_app_id: &str,
        expected_nonce: &str,
    ) -> Result<AttestationVerdict, AttestError>;
}

// ----------------------------------------------------------------------------
// Android: signed integrity JWT
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntegrityClaims {
    request_details: RequestDetails,
    app_integrity: AppIntegrity,
    device_integrity: DeviceIntegrity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestDetails {
    request_package_name: String,
    nonce: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppIntegrity {
    app_recognition_verdict: String,
    #[serde(default)]
    package_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceIntegrity {
    #[serde(default)]
    device_recognition_verdict: Vec<String>,
}

/// Verifies vendor-signed integrity JWTs against the published JWKS.
pub struct PlayIntegrityVerifier {
    client: Client,
    jwks_url: String,
    cache: RwLock<Option<(Instant, Vec<Jwk>)>>,
}

impl PlayIntegrityVerifier {
    pub fn new(jwks_url: String) -> Self {
        let client = Client::builder()
            .timeout(ATTESTATION_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        PlayIntegrityVerifier {
            client,
            jwks_url,
            cache: RwLock::new(None),
        }
    }

    async fn signing_keys(&self) -> Result<Vec<Jwk>, AttestError> {
        {
            let cache = self.cache.read();
            if let Some((fetched_at, keys)) = cache.as_ref() {
                if fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Ok(keys.clone());
                }
            }
        }

        let set: JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AttestError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| AttestError::Service(format!("bad JWKS response: {e}")))?;

        let mut cache = self.cache.write();
        *cache = Some((Instant::now(), set.keys.clone()));
        Ok(set.keys)
    }

    async fn check_token(
        &self,
        token: &str,
        expected_app_id: &str,
        expected_nonce: &str,
    ) -> Result<AttestationVerdict, AttestError> {
        let platform = Platform::Android;

        let header = match decode_header(token) {
            Ok(h) => h,
            Err(e) => return Ok(AttestationVerdict::fail(platform, format!("bad token: {e}"))),
        };
        let kid = match header.kid {
            Some(kid) => kid,
            None => return Ok(AttestationVerdict::fail(platform, "token missing key id")),
        };

        let keys = self.signing_keys().await?;
        let jwk = match keys.iter().find(|k| k.kid == kid) {
            Some(jwk) => jwk,
            None => {
                return Ok(AttestationVerdict::fail(
                    platform,
                    format!("unknown signing key {kid}"),
                ))
            }
        };
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| AttestError::Service(format!("unusable JWKS key: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        // Integrity tokens carry no standard exp claim; freshness is policed
        // through the embedded challenge nonce instead.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let claims = match decode::<IntegrityClaims>(token, &key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                return Ok(AttestationVerdict::fail(
                    platform,
                    format!("signature chain rejected: {e}"),
                ))
            }
        };

        let package = claims
            .app_integrity
            .package_name
            .as_deref()
            .unwrap_or(&claims.request_details.request_package_name);
        if package != expected_app_id {
            return Ok(AttestationVerdict::fail(
                platform,
                format!("package {package} does not match expected app id"),
            ));
        }
        if claims.request_details.nonce != expected_nonce {
            return Ok(AttestationVerdict::fail(platform, "challenge nonce mismatch"));
        }
        if claims.app_integrity.app_recognition_verdict != ALLOWED_APP_VERDICT {
            return Ok(AttestationVerdict::fail(
                platform,
                format!(
                    "app verdict {} not allowed",
                    claims.app_integrity.app_recognition_verdict
                ),
            ));
        }
        let device_ok = claims
            .device_integrity
            .device_recognition_verdict
            .iter()
            .any(|v| ALLOWED_DEVICE_VERDICTS.contains(&v.as_str()));
        if !device_ok {
            return Ok(AttestationVerdict::fail(
                platform,
                "device integrity verdict not in allowed set",
            ));
        }

        Ok(AttestationVerdict::pass(platform))
    }
}

// ----------------------------------------------------------------------------
// iOS: opaque token checked against the vendor attest service
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttestCheckRequest<'a> {
    token: &'a str,
    challenge: &'a str,
    bundle_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestCheckResponse {
    status: String,
    bundle_id: String,
    challenge: String,
    issued_at: String,
}

/// Validates opaque attestation blobs by round-tripping them to the vendor.
pub struct AppAttestVerifier {
    client: Client,
    service_url: String,
}

impl AppAttestVerifier {
    pub fn new(service_url: String) -> Self {
        let client = Client::builder()
            .timeout(ATTESTATION_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        AppAttestVerifier {
            client,
            service_url,
        }
    }

    async fn check_token(
        &self,
        token: &str,
        expected_app_id: &str,
        expected_nonce: &str,
    ) -> Result<AttestationVerdict, AttestError> {
        let platform = Platform::Ios;

        let response = self
            .client
            .post(&self.service_url)
            .json(&AttestCheckRequest {
                token,
                challenge: expected_nonce,
                bundle_id: expected_app_id,
            })
            .send()
            .await
            .map_err(|e| AttestError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AttestError::Service(format!("status {}", response.status())));
        }
        let body: AttestCheckResponse = response
            .json()
            .await
            .map_err(|e| AttestError::Service(format!("bad response: {e}")))?;

        if body.status != "ok" {
            return Ok(AttestationVerdict::fail(
                platform,
                format!("vendor rejected token: {}", body.status),
            ));
        }
        if body.bundle_id != expected_app_id {
            return Ok(AttestationVerdict::fail(
                platform,
                format!("bundle {} does not match expected app id", body.bundle_id),
            ));
        }
        if body.challenge != expected_nonce {
            return Ok(AttestationVerdict::fail(platform, "challenge nonce mismatch"));
        }
        let issued_at = match parse_timestamp(&body.issued_at) {
            Ok(ts) => ts,
            Err(_) => {
                return Ok(AttestationVerdict::fail(
                    platform,
                    format!("unparseable issue time {}", body.issued_at),
                ))
            }
        };
        let age_secs = (Utc::now() - issued_at).num_seconds();
        if age_secs.abs() > CHALLENGE_WINDOW_SECS {
            return Ok(AttestationVerdict::fail(platform, "challenge outside freshness window"));
        }

        Ok(AttestationVerdict::pass(platform))
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// Dispatches to the per-platform verifier; an unconfigured platform is a
/// configuration error, which the policy layer decides how to treat.
pub struct AttestationRouter {
    android: Option<PlayIntegrityVerifier>,
    ios: Option<AppAttestVerifier>,
}

impl AttestationRouter {
    pub fn new(android: Option<PlayIntegrityVerifier>, ios: Option<AppAttestVerifier>) -> Self {
        AttestationRouter { android, ios }
    }

    /// No verifiers configured; every call reports Config.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }
}

#[async_trait]
impl DeviceAttestor for AttestationRouter {
    async fn verify(
        &self,
        token: &str,
        platform: Platform,
        expected_app_id: &str,
        expected_nonce: &str,
    ) -> Result<AttestationVerdict, AttestError> {
        match platform {
            Platform::Android => match &self.android {
                Some(verifier) => verifier.check_token(token, expected_app_id, expected_nonce).await,
                None => Err(AttestError::Config("no android verifier configured".into())),
            },
            Platform::Ios => match &self.ios {
                Some(verifier) => verifier.check_token(token, expected_app_id, expected_nonce).await,
                None => Err(AttestError::Config("no ios verifier configured".into())),
            },
        }
    }
}

/// Fixed-verdict attestor for pipeline tests.
#[cfg(test)]
pub struct StaticAttestor {
    pub passed: bool,
}

#[cfg(test)]
#[async_trait]
impl DeviceAttestor for StaticAttestor {
    async fn verify(
        &self,
        _token: &str,
        platform: Platform,
        _expected_app_id: &str,
        _expected_nonce: &str,
    ) -> Result<AttestationVerdict, AttestError> {
        Ok(if self.passed {
            AttestationVerdict::pass(platform)
        } else {
            AttestationVerdict::fail(platform, "static attestor rejection")
        })
    }
}
