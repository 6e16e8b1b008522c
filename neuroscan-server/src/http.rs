//! NeuroScan HTTP API
//!
//! Axum-based HTTP server for scan upload, chat, history and the viewer.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function. The inner functions are directly testable without axum dispatch
//! machinery.
//!
//! Endpoints:
//! - POST   /analyze_mri                 upload + analyze + persist one scan
//! - POST   /chat                        question grounded in a stored analysis
//! - GET    /history                     stored scans, newest first
//! - GET    /history/:timestamp          one stored scan
//! - GET    /history/:timestamp/image    stored image bytes
//! - POST   /run-viewer                  launch the local 3D viewer
//! - DELETE /inflight/:kind              cancel this client's outstanding request
//! - GET    /health, /version

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use neuroscan_core::inflight::ANONYMOUS_CLIENT;
use neuroscan_core::{
    AnalysisRequestor, ChatRequestor, ErrorKind, GenerativeModel, InFlightGuard, NeuroscanConfig,
    NeuroscanError, OperationKind, ScanStore, TimestampClaims,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::subsystems::{analyze, chat, history, viewer};

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub config: NeuroscanConfig,
    pub store: Arc<dyn ScanStore>,
    pub analysis: AnalysisRequestor,
    pub chat: ChatRequestor,
    pub claims: TimestampClaims,
    pub guard: InFlightGuard,
}

impl HttpState {
    pub fn new(
        config: NeuroscanConfig,
        store: Arc<dyn ScanStore>,
        model: Arc<dyn GenerativeModel>,
    ) -> Self {
        let timeout = Duration::from_secs(config.model.timeout_seconds);
        Self {
            analysis: AnalysisRequestor::new(model.clone(), config.analysis)
                .with_timeout(timeout),
            chat: ChatRequestor::new(model, store.clone()).with_timeout(timeout),
            store,
            config,
            claims: TimestampClaims::new(),
            guard: InFlightGuard::new(),
        }
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let upload_limit = state.config.http.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/analyze_mri", post(analyze_handler))
        .route("/chat", post(chat_handler))
        .route("/history", get(history_handler))
        .route("/history/:timestamp", get(history_item_handler))
        .route("/history/:timestamp/image", get(history_image_handler))
        .route("/run-viewer", post(viewer_handler))
        .route("/inflight/:kind", delete(cancel_handler))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("NeuroScan HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Error mapping
// ============================================================================

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::MalformedResponse | ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Flat `{ error }` body; malformed model replies also carry `raw_response`.
pub fn error_response(err: &NeuroscanError) -> (StatusCode, serde_json::Value) {
    let status = status_for(err.kind());
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), error = %err, "Request failed");
    } else {
        tracing::debug!(status = status.as_u16(), error = %err, "Request rejected");
    }

    let mut body = json!({ "error": err.to_string() });
    if let NeuroscanError::Analysis(inner) = err {
        if let Some(raw) = inner.raw_response() {
            body["raw_response"] = json!(raw);
        }
    }
    (status, body)
}

/// `X-Client-Id`, or the shared anonymous client.
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT)
        .to_string()
}

fn into_http(result: Result<serde_json::Value, NeuroscanError>) -> (StatusCode, serde_json::Value) {
    match result {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

/// Inner health check; reports the configured backends.
pub fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "storage": state.store.name(),
            "model": state.analysis.model_name(),
        }),
    )
}

/// Inner version: version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "service": "neuroscan",
    })
}

pub async fn analyze_inner(
    state: &HttpState,
    client: &str,
    upload: analyze::Upload,
) -> (StatusCode, serde_json::Value) {
    into_http(analyze::analyze_and_store(state, client, upload).await)
}

pub async fn chat_inner(
    state: &HttpState,
    client: &str,
    req: chat::ChatRequest,
) -> (StatusCode, serde_json::Value) {
    into_http(chat::answer(state, client, req).await)
}

pub async fn history_inner(state: &HttpState, query: HistoryQuery) -> (StatusCode, serde_json::Value) {
    into_http(history::list_history(state.store.as_ref(), query.limit).await)
}

pub async fn history_item_inner(state: &HttpState, timestamp: &str) -> (StatusCode, serde_json::Value) {
    into_http(history::history_item(state.store.as_ref(), timestamp).await)
}

pub async fn viewer_inner(
    state: &HttpState,
    client: &str,
    req: viewer::ViewerRequest,
) -> (StatusCode, serde_json::Value) {
    match viewer::launch(state, client, req).await {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            let (status, mut body) = error_response(&e);
            body["success"] = json!(false);
            (status, body)
        }
    }
}

pub fn cancel_inner(guard: &InFlightGuard, client: &str, kind: &str) -> (StatusCode, serde_json::Value) {
    match kind.parse::<OperationKind>() {
        Ok(kind) => (StatusCode::OK, json!({ "cancelled": guard.cancel(client, kind) })),
        Err(e) => (StatusCode::BAD_REQUEST, json!({ "error": e })),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

/// Extractor failures share the flat `{error}` body and always answer 400.
fn rejected(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state);
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn analyze_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    let upload = match analyze::read_upload(multipart).await {
        Ok(upload) => upload,
        Err((status, message)) => return (status, Json(json!({ "error": message }))),
    };
    let (status, body) = analyze_inner(&state, &client_id(&headers), upload).await;
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    payload: Result<Json<chat::ChatRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rejection) => return rejected(rejection.body_text()),
    };
    let (status, body) = chat_inner(&state, &client_id(&headers), req).await;
    (status, Json(body))
}

pub async fn history_handler(
    State(state): State<Arc<HttpState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> impl IntoResponse {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return rejected(rejection.body_text()),
    };
    let (status, body) = history_inner(&state, query).await;
    (status, Json(body))
}

pub async fn history_item_handler(
    State(state): State<Arc<HttpState>>,
    Path(timestamp): Path<String>,
) -> impl IntoResponse {
    let (status, body) = history_item_inner(&state, &timestamp).await;
    (status, Json(body))
}

pub async fn history_image_handler(
    State(state): State<Arc<HttpState>>,
    Path(timestamp): Path<String>,
) -> Response {
    match history::history_image(state.store.as_ref(), &timestamp).await {
        Ok(image) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, image.content_type)],
            Body::from(image.bytes),
        )
            .into_response(),
        Err(e) => {
            let (status, body) = error_response(&e);
            (status, Json(body)).into_response()
        }
    }
}

pub async fn viewer_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    payload: Result<Json<viewer::ViewerRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            let (status, Json(mut body)) = rejected(rejection.body_text());
            body["success"] = json!(false);
            return (status, Json(body));
        }
    };
    let (status, body) = viewer_inner(&state, &client_id(&headers), req).await;
    (status, Json(body))
}

pub async fn cancel_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    let (status, body) = cancel_inner(&state.guard, &client_id(&headers), &kind);
    (status, Json(body))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
