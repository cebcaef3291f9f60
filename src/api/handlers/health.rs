//! Liveness and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rota-pool"
        })),
    )
}

/// Uptime plus pool summary
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "providers": state.manager.provider_names(),
        "pool": state.manager.get_stats(),
    }))
}
