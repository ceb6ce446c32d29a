//! Health, liveness, readiness, and metrics endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::lifecycle::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually healthy. `orphaned` counts handler units
/// still running after their request timed out.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.lifecycle.health_state();
    let stats = state.lifecycle.stats();

    Json(json!({
        "state": health.as_str(),
        "in_flight": stats.in_flight(),
        "orphaned": stats.orphaned(),
        "late_completions": stats.late_completions(),
        "timeouts": stats.timeouts(),
        "panics": stats.panics(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus text exposition of the process metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
