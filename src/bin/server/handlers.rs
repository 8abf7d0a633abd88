//! HTTP handlers for the gateway API
//!
//! Thin wrappers mapping requests onto the library: the ingest endpoints
//! feed the coordinator, `/metrics` renders the scrape exporter, and the
//! `/status` pair serves the cached public projection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use metricz_gateway::config::Config;
use metricz_gateway::error::IngestError;
use metricz_gateway::ingest::{BodyFormat, Ingestor};
use metricz_gateway::public::PublicProjector;
use metricz_gateway::scrape::ScrapeExporter;
use metricz_gateway::storage::Storage;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state handed to every handler
pub struct AppState {
    /// Ingest coordinator
    pub ingestor: Ingestor,
    /// Scrape renderer
    pub exporter: ScrapeExporter,
    /// Public status projector
    pub projector: PublicProjector,
    /// Whether /status endpoints are enabled
    pub public_enabled: bool,
    /// Whether public responses carry CORS headers
    pub public_cors: bool,
}

impl AppState {
    /// Assemble the state over shared storage from the configuration
    pub fn new(storage: Arc<Storage>, cfg: &Config) -> Self {
        Self {
            ingestor: Ingestor::new(storage.clone(), &cfg.ingest),
            exporter: ScrapeExporter::new(storage.clone(), &cfg.stale),
            projector: PublicProjector::new(
                storage,
                cfg.public_export.clone(),
                cfg.public.cache_ttl(),
            ),
            public_enabled: cfg.public.enabled,
            public_cors: cfg.public.cors,
        }
    }
}

/// Build the full application router
pub fn build_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/ingest/:instance_id", post(ingest_single))
        .route("/ingest/:instance_id/:txn_hash/:seq_id", post(ingest_chunk))
        .route("/commit/:instance_id/:txn_hash", post(commit))
        .route("/metrics", get(metrics))
        .route("/status", get(status_all))
        .route("/status/:instance_id", get(status_single))
        .route("/health", get(health))
        .route("/health/liveness", get(health))
        .route("/health/readiness", get(health))
        // The coordinator owns the exact cap; leave it headroom so the
        // boundary case reaches it instead of the framework
        .layer(DefaultBodyLimit::max(max_body_size.saturating_add(1024)))
        .with_state(state)
}

fn body_format(params: &HashMap<String, String>) -> BodyFormat {
    BodyFormat::from_query(params.get("format").map(String::as_str))
}

fn error_response(err: IngestError) -> (StatusCode, String) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string())
}

// =============================================================================
// Ingest Handlers
// =============================================================================

/// Single-shot upload: the entire payload in one request
async fn ingest_single(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    match state
        .ingestor
        .single_shot(&instance_id, body, body_format(&params))
    {
        Ok(outcome) => {
            debug!(
                instance_id = %instance_id,
                families = outcome.families,
                bytes = outcome.bytes,
                "Single-shot metrics updated"
            );
            (StatusCode::OK, "OK".to_string())
        }
        Err(e) => {
            warn!(error = %e, instance_id = %instance_id, "Single-shot ingest failed");
            error_response(e)
        }
    }
}

/// One chunk of a transaction-based upload
async fn ingest_chunk(
    State(state): State<Arc<AppState>>,
    Path((instance_id, txn_hash, seq_id)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    match state
        .ingestor
        .chunk(&instance_id, &txn_hash, &seq_id, body, body_format(&params))
    {
        Ok(()) => (StatusCode::ACCEPTED, "OK".to_string()),
        Err(e) => {
            warn!(error = %e, instance_id = %instance_id, txn = %txn_hash, "Chunk rejected");
            error_response(e)
        }
    }
}

/// Commit a staged transaction
async fn commit(
    State(state): State<Arc<AppState>>,
    Path((instance_id, txn_hash)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.ingestor.commit(&instance_id, &txn_hash) {
        Ok(outcome) => {
            debug!(
                instance_id = %instance_id,
                txn = %txn_hash,
                chunks = outcome.chunks,
                bytes = outcome.bytes,
                families = outcome.families,
                "Transaction committed"
            );
            (StatusCode::OK, "OK".to_string())
        }
        Err(e) => {
            warn!(error = %e, instance_id = %instance_id, txn = %txn_hash, "Commit failed");
            error_response(e)
        }
    }
}

// =============================================================================
// Read Handlers
// =============================================================================

/// Prometheus scrape endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (body, content_type) = state.exporter.export_http();
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
}

fn public_headers(state: &AppState, cache: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("X-Cache", HeaderValue::from_static(cache));
    if state.public_cors {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, OPTIONS"),
        );
    }
    headers
}

/// Public status for all instances
async fn status_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.public_enabled {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), "Not Found".to_string());
    }

    let (body, cache) = state.projector.status_all();
    (
        StatusCode::OK,
        public_headers(&state, cache.header_value()),
        body,
    )
}

/// Public status for one instance
async fn status_single(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    if !state.public_enabled {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), "Not Found".to_string());
    }

    match state.projector.status_single(&instance_id) {
        Some((body, cache)) => (
            StatusCode::OK,
            public_headers(&state, cache.header_value()),
            body,
        ),
        None => (
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            "Instance not found".to_string(),
        ),
    }
}

// =============================================================================
// Health Handlers
// =============================================================================

#[derive(Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    build: BuildInfo,
}

/// Liveness/readiness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        build: BuildInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        },
    })
}
