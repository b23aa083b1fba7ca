//! Health check endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use terminal_sync::EngineStatus;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    sync: EngineStatus,
}

/// Health check handler
///
/// Degraded whenever the stream is not connected or a topic gave up.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let sync = state.sync.status();
    let failed_topics = sync
        .topics
        .iter()
        .any(|t| matches!(t.state, terminal_core::TopicState::Error { .. }));

    let healthy = !sync.state.is_degraded() && !failed_topics;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        sync,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}

/// Simple liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
}
