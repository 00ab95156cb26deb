//! Error types for stepmesh

use thiserror::Error;

use crate::crypto::SignatureError;
use crate::mesh::MeshError;
use crate::persistence::StoreError;

/// Errors surfaced by the proof-submission pipeline.
///
/// The `code()` strings are part of the public contract: they appear
/// verbatim in HTTP responses and clients branch on them.
#[derive(Error, Debug)]
pub enum ProofError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("signature verification failed: {0}")]
    BadSignature(#[from] SignatureError),
    #[error("reported position is outside triangle {triangle}")]
    OutOfBounds { triangle: String },
    #[error("GPS accuracy {accuracy_m} m exceeds the {max_m} m limit")]
    LowGpsAccuracy { accuracy_m: f64, max_m: f64 },
    #[error("confidence {confidence} is below the acceptance threshold")]
    LowConfidence {
        confidence: u32,
        reasons: Vec<String>,
    },
    #[error("attestation token is required but was not supplied")]
    AttestationRequired,
    #[error("attestation failed: {0}")]
    AttestationFailed(String),
    #[error("nonce was already used by this account")]
    NonceReplay,
    #[error("implied speed {speed_mps:.1} m/s exceeds the {limit_mps} m/s limit")]
    TooFast { speed_mps: f64, limit_mps: f64 },
    #[error("only {elapsed_ms} ms since the previous proof; minimum is {min_ms} ms")]
    Moratorium { elapsed_ms: i64, min_ms: u64 },
    #[error("triangle not found: {0}")]
    TriangleNotFound(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ProofError {
    /// Stable machine-readable error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ProofError::InvalidPayload(_) => "InvalidPayload",
            ProofError::BadSignature(_) => "BadSignature",
            ProofError::OutOfBounds { .. } => "OutOfBounds",
            ProofError::LowGpsAccuracy { .. } => "LowGpsAccuracy",
            ProofError::LowConfidence { .. } => "LowConfidence",
            ProofError::AttestationRequired => "AttestationRequired",
            ProofError::AttestationFailed(_) => "AttestationFailed",
            ProofError::NonceReplay => "NonceReplay",
            ProofError::TooFast { .. } => "TooFast",
            ProofError::Moratorium { .. } => "Moratorium",
            ProofError::TriangleNotFound(_) => "TriangleNotFound",
            ProofError::InternalError(_) => "InternalError",
        }
    }

    /// HTTP status code for the flat proof-endpoint response.
    pub fn http_status(&self) -> u16 {
        match self {
            ProofError::InvalidPayload(_) => 400,
            ProofError::BadSignature(_) => 401,
            ProofError::NonceReplay => 409,
            ProofError::TriangleNotFound(_) => 404,
            ProofError::OutOfBounds { .. }
            | ProofError::LowGpsAccuracy { .. }
            | ProofError::LowConfidence { .. }
            | ProofError::AttestationRequired
            | ProofError::AttestationFailed(_)
            | ProofError::TooFast { .. }
            | ProofError::Moratorium { .. } => 422,
            ProofError::InternalError(_) => 500,
        }
    }
}

impl From<MeshError> for ProofError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::MalformedId(_) | MeshError::BadChecksum => {
                ProofError::InvalidPayload(err.to_string())
            }
            other => ProofError::InternalError(other.to_string()),
        }
    }
}

impl From<StoreError> for ProofError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateNonce => ProofError::NonceReplay,
            StoreError::TriangleRetired(id) => {
                ProofError::TriangleNotFound(format!("{id} is subdivided; click its children"))
            }
            other => ProofError::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_contract() {
        assert_eq!(ProofError::InvalidPayload("x".into()).http_status(), 400);
        assert_eq!(ProofError::NonceReplay.http_status(), 409);
        assert_eq!(ProofError::TriangleNotFound("t".into()).http_status(), 404);
        assert_eq!(ProofError::AttestationRequired.http_status(), 422);
        assert_eq!(
            ProofError::Moratorium {
                elapsed_ms: 100,
                min_ms: 10_000
            }
            .http_status(),
            422
        );
        assert_eq!(ProofError::InternalError("x".into()).http_status(), 500);
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ProofError::NonceReplay.code(), "NonceReplay");
        assert_eq!(
            ProofError::LowConfidence {
                confidence: 40,
                reasons: vec![]
            }
            .code(),
            "LowConfidence"
        );
    }

    #[test]
    fn test_store_duplicate_nonce_maps_to_replay() {
        let err: ProofError = StoreError::DuplicateNonce.into();
        assert_eq!(err.code(), "NonceReplay");
    }
}
