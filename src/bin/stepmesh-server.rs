//! stepmesh server: opens the store, seeds the face triangles, wires the
//! verifiers and serves the HTTP surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stepmesh::api::{serve, AppState};
use stepmesh::attestation::{AppAttestVerifier, AttestationRouter, PlayIntegrityVerifier};
use stepmesh::celltower::CellLocator;
use stepmesh::config::Config;
use stepmesh::persistence::Store;
use stepmesh::submission::ProofService;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(1);
        }
    };

    let store = open_store_with_wait(&config);
    match store.ensure_face_triangles() {
        Ok(0) => {}
        Ok(created) => info!(created, "seeded face triangles"),
        Err(e) => {
            error!(error = %e, "could not seed face triangles");
            std::process::exit(1);
        }
    }

    let attestor = AttestationRouter::new(
        config
            .play_integrity_jwks_url
            .clone()
            .map(PlayIntegrityVerifier::new),
        config.app_attest_url.clone().map(AppAttestVerifier::new),
    );
    let cell = CellLocator::new(
        config.cell_lookup_url.clone(),
        config.cell_fallback_url.clone(),
        config.cell_fallback_key.clone(),
    );

    let store = Arc::new(store);
    let config = Arc::new(config);
    let service = Arc::new(ProofService::new(
        store.clone(),
        Arc::new(attestor),
        Arc::new(cell),
        config.clone(),
    ));

    let state = AppState {
        service,
        store,
        config,
    };
    if let Err(e) = serve(state).await {
        error!(error = %e, "server exited");
        std::process::exit(1);
    }
}

/// Retries the store open for up to `STARTUP_DB_WAIT_MS` so the service can
/// come up while its volume is still attaching.
fn open_store_with_wait(config: &Config) -> Store {
    let deadline = Instant::now() + Duration::from_millis(config.startup_db_wait_ms);
    loop {
        match Store::open(&config.database_path) {
            Ok(store) => return store,
            Err(e) => {
                if Instant::now() >= deadline {
                    error!(
                        path = %config.database_path,
                        error = %e,
                        "store did not become available in time"
                    );
                    std::process::exit(1);
                }
                warn!(error = %e, "store not ready, retrying");
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
}
