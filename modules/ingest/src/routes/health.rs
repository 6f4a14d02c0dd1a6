use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;

use super::AppState;

/// Health check endpoint handler
pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ingest-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 200 once the consumers are running, 503 before startup completes and
/// after shutdown begins
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "queues": state.queue_names(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready" })),
        )
    }
}
