use axum::{Json, extract::State, response::IntoResponse};

use crate::app::AppState;
use crate::metrics;

/// Health check endpoint - returns bridge status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let kernels = state.bridge.kernels().list().await.len() as u64;
    let channels = state.bridge.multiplexer.channel_count().await as u64;
    let snapshot = state.bridge.metrics.snapshot();

    let status = if snapshot.envelopes.send_failures == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        kernels,
        channels,
        surfaces: snapshot.surfaces.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed bridge metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.metrics.snapshot())
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
