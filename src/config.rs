//! Environment-driven configuration for stepmesh.

use std::env;
use thiserror::Error;

use crate::attestation::Platform;
use crate::confidence::ScoringWeights;

/// Hard per-request deadline; verifier sub-calls run inside it with their
/// own shorter timeouts.
pub const REQUEST_DEADLINE_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {key} has unusable value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// SQLite database path (the persistence DSN).
    pub database_path: String,
    /// Accuracy gate limit in metres.
    pub gps_max_accuracy_m: f64,
    /// Speed gate limit in metres per second.
    pub proof_speed_limit_mps: f64,
    /// Minimum inter-proof interval per account.
    pub proof_moratorium_ms: u64,
    /// Confidence acceptance cut-off.
    pub acceptance_threshold: u32,
    /// Hard-fail proofs that carry no attestation token.
    pub require_attestation: bool,
    pub android_package_name: Option<String>,
    pub ios_bundle_id: Option<String>,
    /// How long startup waits for the store before giving up.
    pub startup_db_wait_ms: u64,
    pub cell_lookup_url: Option<String>,
    pub cell_fallback_url: Option<String>,
    pub cell_fallback_key: Option<String>,
    pub play_integrity_jwks_url: Option<String>,
    pub app_attest_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 5500,
            database_path: String::new(),
            gps_max_accuracy_m: 50.0,
            proof_speed_limit_mps: 15.0,
            proof_moratorium_ms: 10_000,
            acceptance_threshold: 70,
            require_attestation: false,
            android_package_name: None,
            ios_bundle_id: None,
            startup_db_wait_ms: 15_000,
            cell_lookup_url: None,
            cell_fallback_url: None,
            cell_fallback_key: None,
            play_integrity_jwks_url: None,
            app_attest_url: None,
        }
    }
}

impl Config {
    /// Reads the enumerated environment keys, falling back to the shipped
    /// defaults. `DATABASE_PATH` is the only hard requirement.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            port: parse_var("PORT", defaults.port)?,
            database_path: env::var("DATABASE_PATH")
                .map_err(|_| ConfigError::Missing("DATABASE_PATH"))?,
            gps_max_accuracy_m: parse_var("GPS_MAX_ACCURACY_M", defaults.gps_max_accuracy_m)?,
            proof_speed_limit_mps: parse_var(
                "PROOF_SPEED_LIMIT_MPS",
                defaults.proof_speed_limit_mps,
            )?,
            proof_moratorium_ms: parse_var("PROOF_MORATORIUM_MS", defaults.proof_moratorium_ms)?,
            acceptance_threshold: parse_var(
                "CONFIDENCE_ACCEPTANCE_THRESHOLD",
                defaults.acceptance_threshold,
            )?,
            require_attestation: parse_bool_var(
                "CONFIDENCE_REQUIRE_ATTESTATION",
                defaults.require_attestation,
            )?,
            android_package_name: optional_var("ANDROID_PACKAGE_NAME"),
            ios_bundle_id: optional_var("IOS_BUNDLE_ID"),
            startup_db_wait_ms: parse_var("STARTUP_DB_WAIT_MS", defaults.startup_db_wait_ms)?,
            cell_lookup_url: optional_var("CELL_LOOKUP_URL"),
            cell_fallback_url: optional_var("CELL_FALLBACK_URL"),
            cell_fallback_key: optional_var("CELL_FALLBACK_KEY"),
            play_integrity_jwks_url: optional_var("PLAY_INTEGRITY_JWKS_URL"),
            app_attest_url: optional_var("APP_ATTEST_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.require_attestation
            && self.android_package_name.is_none()
            && self.ios_bundle_id.is_none()
        {
            return Err(ConfigError::Inconsistent(
                "CONFIDENCE_REQUIRE_ATTESTATION is on but neither ANDROID_PACKAGE_NAME nor \
                 IOS_BUNDLE_ID is set"
                    .into(),
            ));
        }
        Ok(())
    }

    /// The default scoring weights with this deployment's threshold.
    pub fn weights(&self) -> ScoringWeights {
        ScoringWeights {
            acceptance_threshold: self.acceptance_threshold,
            ..ScoringWeights::default()
        }
    }

    /// The app identity an attestation token must attest for.
    pub fn expected_app_id(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Android => self.android_package_name.as_deref(),
            Platform::Ios => self.ios_bundle_id.as_deref(),
        }
    }

    /// Current thresholds, as echoed by `GET /proof/config`.
    pub fn thresholds_json(&self) -> serde_json::Value {
        serde_json::json!({
            "gpsMaxAccuracyM": self.gps_max_accuracy_m,
            "proofSpeedLimitMps": self.proof_speed_limit_mps,
            "proofMoratoriumMs": self.proof_moratorium_ms,
            "confidenceAcceptanceThreshold": self.acceptance_threshold,
            "confidenceRequireAttestation": self.require_attestation,
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(default),
    }
}

fn parse_bool_var(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
        _ => Ok(default),
    }
}
