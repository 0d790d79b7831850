//! Discovery HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Indexed document count and service version |
//! | `GET`, `HEAD` | `/status` | `200 OK` once at least one document is indexed, else `500` |
//! | `GET` | `/.well-known/webfinger` | One `disco-json` link per indexed entity |
//! | `GET` | `/entities/` | Raw entities, optionally filtered by `q` |
//! | `GET` | `/entities/{id}` | One raw entity by `{sha1}<digest>[.<suffix>]` identifier |
//!
//! Handlers read whatever generation is published when the request arrives;
//! they never wait on a reload in progress.
//!
//! # Errors
//!
//! Only two fixed bodies are ever returned: `"404 - Not Found\n"` and
//! `"500 - Not enough data\n"`. An engine failure while answering a query is
//! logged and answered with an empty `500`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so that discovery
//! front-ends can query the service from the browser.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::models::RawEntity;
use crate::query::{QueryService, ServiceSummary, Webfinger};
use crate::reload::ReloadCoordinator;

const STATUS_OK: &str = "OK\n";
const STATUS_NOT_ENOUGH_DATA: &str = "500 - Not enough data\n";
const NOT_FOUND: &str = "404 - Not Found\n";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    queries: Arc<QueryService>,
    /// Configured public base URL, without trailing slash.
    base_url: Option<String>,
}

/// Builds the router over the coordinator's published generations.
pub fn router(coordinator: Arc<ReloadCoordinator>, config: &ServerConfig) -> Router {
    let state = AppState {
        queries: Arc::new(QueryService::new(
            coordinator,
            config.search_limit,
            config.webfinger_ttl_secs,
        )),
        base_url: config
            .base_url
            .as_ref()
            .map(|url| url.trim_end_matches('/').to_string()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_summary))
        .route("/status", get(handle_status))
        .route("/.well-known/webfinger", get(handle_webfinger))
        .route("/entities", get(handle_entities))
        .route("/entities/", get(handle_entities))
        .route("/entities/{id}", get(handle_entity))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `config.bind` and serves until the process is terminated.
pub async fn run_server(
    coordinator: Arc<ReloadCoordinator>,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    let app = router(coordinator, config);
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

/// An engine failure while answering a request.
struct AppError(anyhow::Error);

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = format!("{:#}", self.0), "query failed");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

// ============ GET / ============

async fn handle_summary(State(state): State<AppState>) -> Result<Json<ServiceSummary>, AppError> {
    Ok(Json(state.queries.summary()?))
}

// ============ GET|HEAD /status ============

async fn handle_status(State(state): State<AppState>) -> Response {
    match state.queries.is_healthy() {
        Ok(true) => (StatusCode::OK, STATUS_OK).into_response(),
        Ok(false) => (StatusCode::INTERNAL_SERVER_ERROR, STATUS_NOT_ENOUGH_DATA).into_response(),
        Err(e) => {
            error!(error = format!("{:#}", e), "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, STATUS_NOT_ENOUGH_DATA).into_response()
        }
    }
}

// ============ GET /.well-known/webfinger ============

async fn handle_webfinger(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Webfinger>, AppError> {
    let base_url = state
        .base_url
        .clone()
        .unwrap_or_else(|| base_url_from_headers(&headers));
    Ok(Json(state.queries.webfinger(&base_url)?))
}

/// `<scheme>://<host>` of the request as the client addressed it.
fn base_url_from_headers(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

// ============ GET /entities/ ============

#[derive(Debug, Deserialize)]
struct EntitiesParams {
    q: Option<String>,
}

async fn handle_entities(
    State(state): State<AppState>,
    Query(params): Query<EntitiesParams>,
) -> Result<Json<Vec<RawEntity>>, AppError> {
    Ok(Json(state.queries.search(params.q.as_deref())?))
}

// ============ GET /entities/{id} ============

async fn handle_entity(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.queries.lookup(&id) {
        Some(entity) => Json(entity).into_response(),
        None => (StatusCode::NOT_FOUND, NOT_FOUND).into_response(),
    }
}
