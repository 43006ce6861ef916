//! Unauthenticated health and metrics endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_text(State(state): State<AppState>) -> String {
    state.metrics.render()
}
