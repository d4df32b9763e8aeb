use axum::{
    Router,
    routing::{delete, get},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

use crate::handlers;
use crate::surface::BridgeContext;

#[derive(Clone)]
pub struct AppState {
    pub bridge: BridgeContext,
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
pub struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/bridge", get(handlers::bridge_websocket_handler))
        .route(
            "/api/local-kernels",
            get(handlers::list_kernels).post(handlers::launch_kernel),
        )
        .route("/api/local-kernels/{id}", delete(handlers::shutdown_kernel))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
