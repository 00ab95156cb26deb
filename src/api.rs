//! HTTP surface for stepmesh.
//!
//! The proof endpoint speaks a flat request/response shape; every mesh
//! read returns the `{ok, result, timestamp}` envelope. All timestamps are
//! ISO-8601 milliseconds UTC with a trailing `Z`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, REQUEST_DEADLINE_MS};
use crate::error::ProofError;
use crate::geometry::{haversine_m, spherical_triangle_area_m2, GeoPoint};
use crate::mesh::{self, MeshError, TriangleId, MAX_LEVEL, MIN_LEVEL};
use crate::persistence::Store;
use crate::proof::format_timestamp;
use crate::submission::ProofService;

const DEFAULT_LOCATE_LEVEL: u8 = 10;
const DEFAULT_SEARCH_RESULTS: usize = 100;
const MAX_SEARCH_RESULTS: usize = 1_000;
const DEFAULT_NEAREST_COUNT: usize = 5;
const MAX_NEAREST_COUNT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProofService>,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/proof/submit", post(submit_proof))
        .route("/proof/config", get(proof_config))
        .route("/mesh/triangleAt", get(mesh_triangle_at))
        .route("/mesh/polygon/:id", get(mesh_polygon))
        .route("/mesh/children/:id", get(mesh_children))
        .route("/mesh/parent/:id", get(mesh_parent))
        .route("/mesh/search", get(mesh_search))
        .route("/mesh/nearest", get(mesh_nearest))
        .route("/mesh/info/:id", get(mesh_info))
        .route("/mesh/stats", get(mesh_stats))
        .route("/account/:address", get(account_info))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Binds the listener and serves until shutdown.
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let port = state.config.port;
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "stepmesh listening");
    axum::serve(listener, app).await
}

// ----------------------------------------------------------------------------
// Envelopes
// ----------------------------------------------------------------------------

fn envelope_ok<T: Serialize>(result: T) -> Response {
    Json(json!({
        "ok": true,
        "result": result,
        "timestamp": format_timestamp(&Utc::now()),
    }))
    .into_response()
}

fn envelope_err(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "ok": false,
            "error": { "code": code, "message": message.into() },
            "timestamp": format_timestamp(&Utc::now()),
        })),
    )
        .into_response()
}

fn mesh_error_response(err: MeshError) -> Response {
    let code = match err {
        MeshError::MalformedId(_) => "MalformedId",
        MeshError::BadChecksum => "BadChecksum",
        MeshError::MaxLevel => "MaxLevel",
        MeshError::RootLevel => "RootLevel",
        MeshError::InvalidCoordinates(_, _) => "InvalidCoordinates",
        MeshError::InvalidLevel(_) => "InvalidLevel",
        MeshError::InvalidFace(_) => "InvalidFace",
    };
    envelope_err(StatusCode::BAD_REQUEST, code, err.to_string())
}

fn store_error_response(err: crate::persistence::StoreError) -> Response {
    envelope_err(
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError",
        err.to_string(),
    )
}

// ----------------------------------------------------------------------------
// Proof endpoints
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    payload: serde_json::Value,
    signature: String,
}

async fn submit_proof(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    let deadline = Duration::from_millis(REQUEST_DEADLINE_MS);
    let result =
        tokio::time::timeout(deadline, state.service.submit(req.payload, &req.signature)).await;
    match result {
        Ok(Ok(accepted)) => (StatusCode::OK, Json(accepted)).into_response(),
        Ok(Err(err)) => proof_error_response(err),
        Err(_) => proof_error_response(ProofError::InternalError(
            "request deadline exceeded".into(),
        )),
    }
}

fn proof_error_response(err: ProofError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "code": err.code(),
        "message": err.to_string(),
        "timestamp": format_timestamp(&Utc::now()),
    });
    if let ProofError::LowConfidence {
        confidence,
        reasons,
    } = &err
    {
        body["confidence"] = json!(confidence);
        body["reasons"] = json!(reasons);
    }
    (status, Json(body)).into_response()
}

async fn proof_config(State(state): State<AppState>) -> Response {
    Json(state.config.thresholds_json()).into_response()
}

// ----------------------------------------------------------------------------
// Mesh endpoints (pure reads)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriangleAtQuery {
    lat: f64,
    lon: f64,
    level: Option<u8>,
    #[serde(default)]
    include_polygon: bool,
}

fn triangle_summary(id: &TriangleId, include_polygon: bool) -> serde_json::Value {
    let mut out = json!({
        "triangleId": id.to_string(),
        "face": id.face(),
        "level": id.level(),
        "path": id.path_string(),
        "centroid": id.centroid(),
        "estimatedSideLength": id.estimated_side_length_m(),
    });
    if include_polygon {
        out["polygon"] = json!(id.polygon());
    }
    out
}

async fn mesh_triangle_at(Query(q): Query<TriangleAtQuery>) -> Response {
    let level = q.level.unwrap_or(DEFAULT_LOCATE_LEVEL);
    match mesh::locate(q.lat, q.lon, level) {
        Ok(id) => envelope_ok(triangle_summary(&id, q.include_polygon)),
        Err(err) => mesh_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolygonQuery {
    #[serde(default)]
    include_metadata: bool,
}

async fn mesh_polygon(Path(id): Path<String>, Query(q): Query<PolygonQuery>) -> Response {
    let id = match TriangleId::decode(&id) {
        Ok(id) => id,
        Err(err) => return mesh_error_response(err),
    };
    let ring = id.polygon();
    let mut result = json!({
        "triangleId": id.to_string(),
        "polygon": ring,
    });
    if q.include_metadata {
        let [a, b, c] = id.vertices();
        let perimeter = haversine_m(&ring[0], &ring[1])
            + haversine_m(&ring[1], &ring[2])
            + haversine_m(&ring[2], &ring[3]);
        result["metadata"] = json!({
            "areaM2": spherical_triangle_area_m2(&a, &b, &c),
            "perimeterM": perimeter,
            "centroid": id.centroid(),
        });
    }
    envelope_ok(result)
}

async fn mesh_children(Path(id): Path<String>) -> Response {
    let id = match TriangleId::decode(&id) {
        Ok(id) => id,
        Err(err) => return mesh_error_response(err),
    };
    match id.children() {
        Ok(children) => envelope_ok(json!({
            "triangleId": id.to_string(),
            "children": children.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        })),
        Err(err) => mesh_error_response(err),
    }
}

async fn mesh_parent(Path(id): Path<String>) -> Response {
    let id = match TriangleId::decode(&id) {
        Ok(id) => id,
        Err(err) => return mesh_error_response(err),
    };
    match id.parent() {
        Ok(parent) => envelope_ok(json!({
            "triangleId": id.to_string(),
            "parent": parent.to_string(),
        })),
        Err(err) => mesh_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
    /// `minLon,minLat,maxLon,maxLat`
    bbox: String,
    level: Option<u8>,
    max_results: Option<usize>,
    #[serde(default)]
    include_polygon: bool,
}

#[derive(Debug, Clone, Copy)]
struct Bbox {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
}

impl Bbox {
    fn parse(s: &str) -> Option<Bbox> {
        let parts: Vec<f64> = s.split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
        if parts.len() != 4 {
            return None;
        }
        let bbox = Bbox {
            min_lon: parts[0],
            min_lat: parts[1],
            max_lon: parts[2],
            max_lat: parts[3],
        };
        (bbox.min_lon <= bbox.max_lon
            && bbox.min_lat <= bbox.max_lat
            && GeoPoint::new(bbox.min_lat, bbox.min_lon).is_valid()
            && GeoPoint::new(bbox.max_lat, bbox.max_lon).is_valid())
        .then_some(bbox)
    }

    fn intersects(&self, other: &Bbox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

fn vertex_bbox(id: &TriangleId) -> Bbox {
    let ring = id.polygon();
    let mut bbox = Bbox {
        min_lon: f64::INFINITY,
        min_lat: f64::INFINITY,
        max_lon: f64::NEG_INFINITY,
        max_lat: f64::NEG_INFINITY,
    };
    for p in &ring[..3] {
        bbox.min_lon = bbox.min_lon.min(p.lon);
        bbox.min_lat = bbox.min_lat.min(p.lat);
        bbox.max_lon = bbox.max_lon.max(p.lon);
        bbox.max_lat = bbox.max_lat.max(p.lat);
    }
    bbox
}

/// Pruned descent from the 20 faces: a triangle is explored only while its
/// vertex bounding box overlaps the query box. Rings spanning the
/// antimeridian are not split and may over-match near ±180°.
fn triangles_in_bbox(bbox: &Bbox, level: u8, cap: usize) -> Vec<TriangleId> {
    let mut found = Vec::new();
    let mut stack: Vec<TriangleId> = (0..mesh::FACE_COUNT)
        .rev()
        .filter_map(|f| TriangleId::face_root(f).ok())
        .collect();

    while let Some(id) = stack.pop() {
        if found.len() >= cap {
            break;
        }
        if !vertex_bbox(&id).intersects(bbox) {
            continue;
        }
        if id.level() == level {
            found.push(id);
            continue;
        }
        if let Ok(children) = id.children() {
            for child in children.into_iter().rev() {
                stack.push(child);
            }
        }
    }
    found
}

async fn mesh_search(Query(q): Query<SearchQuery>) -> Response {
    let Some(bbox) = Bbox::parse(&q.bbox) else {
        return envelope_err(
            StatusCode::BAD_REQUEST,
            "InvalidBbox",
            "bbox must be minLon,minLat,maxLon,maxLat",
        );
    };
    let level = q.level.unwrap_or(DEFAULT_LOCATE_LEVEL);
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return mesh_error_response(MeshError::InvalidLevel(level));
    }
    let cap = q
        .max_results
        .unwrap_or(DEFAULT_SEARCH_RESULTS)
        .min(MAX_SEARCH_RESULTS);

    let triangles = triangles_in_bbox(&bbox, level, cap);
    envelope_ok(json!({
        "count": triangles.len(),
        "triangles": triangles
            .iter()
            .map(|t| triangle_summary(t, q.include_polygon))
            .collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearestQuery {
    lat: f64,
    lon: f64,
    level: Option<u8>,
    count: Option<usize>,
}

async fn mesh_nearest(Query(q): Query<NearestQuery>) -> Response {
    let level = q.level.unwrap_or(DEFAULT_LOCATE_LEVEL);
    let count = q.count.unwrap_or(DEFAULT_NEAREST_COUNT).min(MAX_NEAREST_COUNT);
    let origin = GeoPoint::new(q.lat, q.lon);
    if !origin.is_valid() {
        return mesh_error_response(MeshError::InvalidCoordinates(q.lat, q.lon));
    }
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return mesh_error_response(MeshError::InvalidLevel(level));
    }

    // Grow a box around the point until enough candidates fall inside.
    let side_deg = (mesh::side_length_m(level) / 111_000.0).max(1e-5);
    let mut half = side_deg * 1.5;
    let mut candidates = Vec::new();
    for _ in 0..6 {
        let bbox = Bbox {
            min_lon: (q.lon - half).max(-180.0),
            min_lat: (q.lat - half).max(-90.0),
            max_lon: (q.lon + half).min(180.0),
            max_lat: (q.lat + half).min(90.0),
        };
        candidates = triangles_in_bbox(&bbox, level, MAX_SEARCH_RESULTS);
        if candidates.len() >= count {
            break;
        }
        half *= 2.0;
    }

    let mut ranked: Vec<(f64, TriangleId)> = candidates
        .into_iter()
        .map(|id| (haversine_m(&id.centroid(), &origin), id))
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.truncate(count);

    envelope_ok(json!({
        "count": ranked.len(),
        "triangles": ranked
            .iter()
            .map(|(distance, id)| {
                let mut summary = triangle_summary(id, false);
                summary["distanceM"] = json!(distance);
                summary
            })
            .collect::<Vec<_>>(),
    }))
}

async fn mesh_info(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match TriangleId::decode(&id) {
        Ok(id) => id,
        Err(err) => return mesh_error_response(err),
    };

    let mut result = triangle_summary(&id, true);
    result["parent"] = match id.parent() {
        Ok(parent) => json!(parent.to_string()),
        Err(_) => serde_json::Value::Null,
    };
    result["childIds"] = match id.children() {
        Ok(children) => json!(children.iter().map(|c| c.to_string()).collect::<Vec<_>>()),
        Err(_) => json!([]),
    };

    match state.store.triangle(&id) {
        Ok(Some(record)) => {
            result["materialized"] = json!(true);
            result["state"] = json!(record.state);
            result["clicks"] = json!(record.clicks);
            result["children"] = json!(record.children);
            result["lastClickAt"] = json!(record.last_click_at.map(|ts| format_timestamp(&ts)));
        }
        Ok(None) => {
            result["materialized"] = json!(false);
        }
        Err(err) => return store_error_response(err),
    }
    envelope_ok(result)
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    level: Option<u8>,
}

async fn mesh_stats(State(state): State<AppState>, Query(q): Query<StatsQuery>) -> Response {
    match state.store.stats(q.level) {
        Ok(levels) => {
            let annotated: Vec<serde_json::Value> = levels
                .iter()
                .map(|s| {
                    let capacity = 20u64.saturating_mul(4u64.saturating_pow(u32::from(s.level) - 1));
                    let mut value = serde_json::to_value(s).unwrap_or_default();
                    value["capacity"] = json!(capacity);
                    value
                })
                .collect();
            envelope_ok(json!({ "levels": annotated }))
        }
        Err(err) => store_error_response(err),
    }
}

// ----------------------------------------------------------------------------
// Accounts and health
// ----------------------------------------------------------------------------

async fn account_info(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    let address = address.to_ascii_lowercase();
    match state.store.account_balance_micro(&address) {
        Ok(balance_micro) => envelope_ok(json!({
            "address": address,
            "balanceMicro": balance_micro,
            "balance": crate::reward::format_step(balance_micro),
        })),
        Err(err) => store_error_response(err),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let database = state.store.health();
    let ok = database.status == "ok";
    Json(json!({
        "ok": ok,
        "service": "stepmesh",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),
        "database": database,
        "timestamp": format_timestamp(&Utc::now()),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::StaticAttestor;
    use crate::celltower::CellLocator;
    use crate::crypto;
    use crate::persistence::TriangleRecord;
    use crate::proof::{ProofPayload, ProofPayloadV1};
    use axum_test::TestServer;
    use secp256k1::SecretKey;

    const LAT: f64 = 47.4979;
    const LON: f64 = 19.0402;

    fn secret() -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = 5;
        bytes[7] = 1;
        SecretKey::from_slice(&bytes).unwrap()
    }

    fn test_state() -> (AppState, TriangleId) {
        let store = Arc::new(Store::in_memory().unwrap());
        store.ensure_face_triangles().unwrap();
        let id = mesh::locate(LAT, LON, 10).unwrap();
        store
            .insert_triangle_record(&TriangleRecord::new_active(id.clone(), Utc::now()))
            .unwrap();

        let config = Arc::new(Config {
            acceptance_threshold: 50,
            proof_moratorium_ms: 0,
            ..Config::default()
        });
        let service = Arc::new(ProofService::new(
            store.clone(),
            Arc::new(StaticAttestor { passed: true }),
            Arc::new(CellLocator::disabled()),
            config.clone(),
        ));
        (
            AppState {
                service,
                store,
                config,
            },
            id,
        )
    }

    fn server() -> (TestServer, TriangleId) {
        let (state, id) = test_state();
        (TestServer::new(router(state)).unwrap(), id)
    }

    fn signed_v1(id: &TriangleId, nonce: &str) -> serde_json::Value {
        let payload = ProofPayload::V1(ProofPayloadV1 {
            account: crypto::address_for_secret(&secret()),
            triangle_id: id.to_string(),
            lat: LAT.to_string(),
            lon: LON.to_string(),
            accuracy: "12.5".to_string(),
            timestamp: format_timestamp(&Utc::now()),
            nonce: nonce.to_string(),
        });
        let sig = crypto::sign_message(payload.canonical_message().as_bytes(), &secret());
        json!({
            "payload": serde_json::to_value(&payload).unwrap(),
            "signature": format!("0x{}", hex::encode(sig)),
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _) = server();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body["ok"], true);
        assert_eq!(body["service"], "stepmesh");
        assert_eq!(body["database"]["status"], "ok");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_proof_config_echoes_thresholds() {
        let (server, _) = server();
        let body: serde_json::Value = server.get("/proof/config").await.json();
        assert_eq!(body["gpsMaxAccuracyM"], 50.0);
        assert_eq!(body["confidenceAcceptanceThreshold"], 50);
    }

    #[tokio::test]
    async fn test_submit_accept_then_replay() {
        let (server, id) = server();
        let request = signed_v1(&id, "api-nonce");

        let response = server.post("/proof/submit").json(&request).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body["unit"], "STEP");
        assert_eq!(body["clicks"], 1);
        assert_eq!(body["reward"], "0.001953");
        assert!(body["confidence"].as_u64().unwrap() >= 50);

        let replay = server.post("/proof/submit").json(&request).await;
        assert_eq!(replay.status_code(), StatusCode::CONFLICT);
        let body: serde_json::Value = replay.json();
        assert_eq!(body["code"], "NonceReplay");
    }

    #[tokio::test]
    async fn test_submit_invalid_payload() {
        let (server, _) = server();
        let response = server
            .post("/proof/submit")
            .json(&json!({ "payload": { "version": "bogus" }, "signature": "0x00" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json();
        assert_eq!(body["code"], "InvalidPayload");
    }

    #[tokio::test]
    async fn test_triangle_at_with_polygon() {
        let (server, id) = server();
        let response = server
            .get("/mesh/triangleAt")
            .add_query_param("lat", LAT)
            .add_query_param("lon", LON)
            .add_query_param("level", 10)
            .add_query_param("includePolygon", true)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body["ok"], true);
        assert_eq!(body["result"]["triangleId"], id.to_string());
        assert_eq!(body["result"]["level"], 10);
        assert_eq!(body["result"]["polygon"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_triangle_at_rejects_bad_coordinates() {
        let (server, _) = server();
        let response = server
            .get("/mesh/triangleAt")
            .add_query_param("lat", 95.0)
            .add_query_param("lon", 0.0)
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "InvalidCoordinates");
    }

    #[tokio::test]
    async fn test_polygon_with_metadata() {
        let (server, id) = server();
        let response = server
            .get(&format!("/mesh/polygon/{id}"))
            .add_query_param("includeMetadata", true)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        let metadata = &body["result"]["metadata"];
        assert!(metadata["areaM2"].as_f64().unwrap() > 0.0);
        assert!(metadata["perimeterM"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_children_and_parent_round_trip() {
        let (server, id) = server();
        let body: serde_json::Value = server.get(&format!("/mesh/children/{id}")).await.json();
        let children = body["result"]["children"].as_array().unwrap();
        assert_eq!(children.len(), 4);

        let child = children[0].as_str().unwrap();
        let body: serde_json::Value = server.get(&format!("/mesh/parent/{child}")).await.json();
        assert_eq!(body["result"]["parent"], id.to_string());
    }

    #[tokio::test]
    async fn test_parent_of_root_is_an_error() {
        let (server, _) = server();
        let root = TriangleId::face_root(0).unwrap();
        let response = server.get(&format!("/mesh/parent/{root}")).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "RootLevel");
    }

    #[tokio::test]
    async fn test_malformed_id_rejected() {
        let (server, _) = server();
        let response = server.get("/mesh/polygon/garbage").await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "MalformedId");
    }

    #[tokio::test]
    async fn test_search_finds_triangle_in_bbox() {
        let (server, id) = server();
        let response = server
            .get("/mesh/search")
            .add_query_param("bbox", format!("{},{},{},{}", LON - 0.1, LAT - 0.1, LON + 0.1, LAT + 0.1))
            .add_query_param("level", 10)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        let triangles = body["result"]["triangles"].as_array().unwrap();
        assert!(!triangles.is_empty());
        assert!(triangles
            .iter()
            .any(|t| t["triangleId"] == id.to_string()));
    }

    #[tokio::test]
    async fn test_search_rejects_bad_bbox() {
        let (server, _) = server();
        let response = server
            .get("/mesh/search")
            .add_query_param("bbox", "nonsense")
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_nearest_is_sorted_by_distance() {
        let (server, id) = server();
        let response = server
            .get("/mesh/nearest")
            .add_query_param("lat", LAT)
            .add_query_param("lon", LON)
            .add_query_param("level", 10)
            .add_query_param("count", 5)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        let triangles = body["result"]["triangles"].as_array().unwrap();
        assert_eq!(triangles.len(), 5);
        // The containing triangle ranks among the nearest.
        assert!(triangles.iter().any(|t| t["triangleId"] == id.to_string()));
        let distances: Vec<f64> = triangles
            .iter()
            .map(|t| t["distanceM"].as_f64().unwrap())
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_info_merges_store_record() {
        let (server, id) = server();
        let body: serde_json::Value = server.get(&format!("/mesh/info/{id}")).await.json();
        assert_eq!(body["result"]["materialized"], true);
        assert_eq!(body["result"]["state"], "active");
        assert_eq!(body["result"]["clicks"], 0);

        // An unmaterialized sibling still reports its algebra.
        let other = mesh::locate(-33.8688, 151.2093, 10).unwrap();
        let body: serde_json::Value = server.get(&format!("/mesh/info/{other}")).await.json();
        assert_eq!(body["result"]["materialized"], false);
        assert_eq!(body["result"]["childIds"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_stats_reports_levels() {
        let (server, _) = server();
        let body: serde_json::Value = server.get("/mesh/stats").await.json();
        let levels = body["result"]["levels"].as_array().unwrap();
        assert!(levels.iter().any(|l| l["level"] == 1 && l["triangles"] == 20));
        let level1 = levels.iter().find(|l| l["level"] == 1).unwrap();
        assert_eq!(level1["capacity"], 20);
    }

    #[tokio::test]
    async fn test_account_balance_lazy_zero() {
        let (server, _) = server();
        let body: serde_json::Value = server
            .get("/account/0x00a329c0648769a73afac7f9381e08fb43dbea72")
            .await
            .json();
        assert_eq!(body["result"]["balanceMicro"], 0);
        assert_eq!(body["result"]["balance"], "0.000000");
    }
}
