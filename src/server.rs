// Admin HTTP API
//
// JSON endpoints for rate limit windows, burst overrides, usage series, the
// posting queue, platform pause/resume, SLO health and Prometheus metrics.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::GateError;
use crate::gate::PublishGate;
use crate::metrics;
use crate::queue::{NewQueueItem, QueueState};
use crate::usage::UsageWindow;

/// Shared state for handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub gate: Arc<PublishGate>,
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(gate: Arc<PublishGate>) -> Self {
        Self {
            gate,
            metrics_enabled: true,
        }
    }
}

/// Error response with a `{error}` body
#[derive(Debug)]
pub struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GateError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GateError::UnknownPlatform(_) | GateError::ItemNotFound(_) => StatusCode::NOT_FOUND,
            GateError::InvalidTransition { .. } => StatusCode::CONFLICT,
            GateError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Admin request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ConfigureRequest {
    platform: String,
    window_seconds: u64,
    max_actions: u32,
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    factor: f64,
    minutes: u32,
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    window: Option<String>,
}

impl UsageQuery {
    fn window(&self) -> Result<UsageWindow, GateError> {
        match &self.window {
            Some(w) => w.parse(),
            None => Ok(UsageWindow::default()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    platform: Option<String>,
    state: Option<String>,
}

/// Build the admin router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rate-limits", get(list_windows).put(configure_window))
        .route("/rate-limits/{platform}/reset", post(reset_window))
        .route("/rate-limits/{platform}/usage", get(usage_series))
        .route("/rate-limits/{platform}/usage.csv", get(usage_csv))
        .route(
            "/rate-limits/{platform}/override",
            post(set_override).delete(clear_override),
        )
        .route("/queue/stats", get(queue_stats))
        .route("/queue/items", get(list_items).post(enqueue_item))
        .route("/queue/items/{id}", get(get_item))
        .route("/queue/items/{id}/pause", post(pause_item))
        .route("/queue/items/{id}/resume", post(resume_item))
        .route("/queue/items/{id}/requeue", post(requeue_item))
        .route("/platforms/resume-all", post(resume_all))
        .route("/platforms/{platform}/pause", post(pause_platform))
        .route("/platforms/{platform}/resume", post(resume_platform))
        .route("/metrics/slo", get(slo_snapshot))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` flips to true
pub async fn serve(addr: SocketAddr, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin server on {}", addr))?;

    info!("Admin API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Admin server error")?;

    Ok(())
}

async fn list_windows(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "items": state.gate.registry().windows() }))
}

async fn configure_window(
    State(state): State<AppState>,
    Json(req): Json<ConfigureRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let window = state
        .gate
        .registry()
        .configure(&req.platform, req.window_seconds, req.max_actions)
        .await?;
    Ok(Json(json!({ "ok": true, "window": window })))
}

async fn reset_window(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.gate.registry().reset(&platform).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn usage_series(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let window = query.window()?;
    known_platform(&state, &platform)?;

    let series = state.gate.recorder().series(&platform, window).await?;
    let items: Vec<_> = series
        .buckets
        .iter()
        .map(|b| json!({ "bucket_start": b.bucket_start, "total": b.total }))
        .collect();
    Ok(Json(json!({
        "items": items,
        "moving_average": series.moving_average,
        "window": series.window,
    })))
}

async fn usage_csv(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Response> {
    let window = query.window()?;
    known_platform(&state, &platform)?;

    let csv = state.gate.recorder().export_csv(&platform, window).await?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv).into_response())
}

async fn set_override(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let burst = state
        .gate
        .registry()
        .set_override(&platform, req.factor, req.minutes)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "platform": burst.platform,
        "factor": burst.factor,
        "minutes": burst.duration_minutes,
    })))
}

async fn clear_override(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cleared = state.gate.registry().clear_override(&platform).await?;
    Ok(Json(json!({ "ok": true, "cleared": cleared })))
}

async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gate.queue().stats().await)
}

async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<QueueState>)
        .transpose()?;
    let items = state
        .gate
        .queue()
        .list(query.platform.as_deref(), filter)
        .await;
    Ok(Json(json!({ "items": items })))
}

async fn enqueue_item(
    State(state): State<AppState>,
    Json(req): Json<NewQueueItem>,
) -> ApiResult<impl IntoResponse> {
    let item = state.gate.enqueue(req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.queue().get(&id).await?))
}

async fn pause_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.queue().pause_item(&id).await?))
}

async fn resume_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.queue().resume_item(&id).await?))
}

async fn requeue_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.gate.queue().requeue(&id).await?))
}

async fn pause_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> Json<serde_json::Value> {
    let changed = state.gate.queue().pause_platform(&platform).await;
    Json(json!({ "ok": true, "changed": changed }))
}

async fn resume_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> Json<serde_json::Value> {
    let changed = state.gate.queue().resume_platform(&platform).await;
    Json(json!({ "ok": true, "changed": changed }))
}

async fn resume_all(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let changed = state.gate.resume_all().await?;
    Ok(Json(json!({ "ok": true, "changed": changed })))
}

async fn slo_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gate.slo().snapshot().await)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gate.health().await)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    match metrics::gather_metrics() {
        Ok(metrics_text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

fn known_platform(state: &AppState, platform: &str) -> Result<(), GateError> {
    if state.gate.registry().window(platform).is_none() {
        return Err(GateError::UnknownPlatform(platform.to_string()));
    }
    Ok(())
}
