//! HTTP API for status, metrics, and manual-roll endpoints.
//!
//! Provides:
//! - `/metrics` - Prometheus metrics export
//! - `/health` - Basic daemon health check
//! - `/ready` - Readiness probe (controller ticking without errors)
//! - `/status` - Roller status snapshot (`?sensitive=true` for full view)
//! - `/expectations` - Expectation overrides applied by the reconciler
//! - `/manual_rolls` - List and submit manual roll requests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use roller_common::{ManualRollRequest, RevisionId};
use serde::Deserialize;
use serde_json::json;

use crate::controller::Controller;
use crate::metrics;
use crate::reconciler::ExpectationsStore;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub controller: Arc<Controller>,
    pub expectations: ExpectationsStore,
    pub version: &'static str,
    pub started_at: Instant,
}

/// Create the HTTP router for the observability endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/expectations", get(expectations_handler))
        .route(
            "/manual_rolls",
            get(manual_rolls_handler).post(submit_manual_roll_handler),
        )
        .route("/reset_error", post(reset_error_handler))
        .with_state(Arc::new(state))
}

/// Handler for `/metrics` - Prometheus metrics export.
async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Handler for `/health` - Basic daemon health check.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Handler for `/ready` - Readiness probe.
///
/// Ready once the controller has published a state and the last tick did
/// not fail.
async fn ready_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let status = state.controller.status(false);
    let ticked = !status.state.is_empty();
    let healthy = status.error.is_empty();

    if ticked && healthy {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "state": status.state,
                "mode": status.mode,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": if ticked { "tick_error" } else { "no_tick_yet" },
                "error": status.error,
            })),
        )
    }
}

/// Handler for `/status` - the roller status snapshot.
async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let sensitive = params
        .get("sensitive")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    Json(state.controller.status(sensitive))
}

/// Handler for `/expectations` - reconciled expectation overrides.
async fn expectations_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let entries: Vec<_> = state
        .expectations
        .snapshot()
        .into_iter()
        .map(|((changelist, crs_id), overrides)| {
            json!({
                "changelist_id": changelist,
                "crs_id": crs_id,
                "overrides": overrides,
            })
        })
        .collect();
    Json(json!({ "expectations": entries }))
}

/// Handler for `GET /manual_rolls`.
async fn manual_rolls_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "requests": state.controller.manual_queue().get_recent(50),
    }))
}

/// Body for `POST /manual_rolls`.
#[derive(Debug, Deserialize)]
struct ManualRollSubmission {
    requester: String,
    revision: String,
    roller_name: String,
}

/// Handler for `POST /manual_rolls` - enqueue a manual roll request.
async fn submit_manual_roll_handler(
    State(state): State<Arc<HttpState>>,
    Json(submission): Json<ManualRollSubmission>,
) -> impl IntoResponse {
    let request = ManualRollRequest::new(
        submission.requester,
        RevisionId::new(submission.revision),
        submission.roller_name,
    );
    match state.controller.add_manual_roll(request) {
        Ok(stored) => (StatusCode::OK, Json(json!({ "request": stored }))).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// Handler for `POST /reset_error` - clear the sticky tick error.
async fn reset_error_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    state.controller.reset_error();
    StatusCode::NO_CONTENT
}

/// Start the HTTP server for the observability endpoints.
pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("starting HTTP server on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}
