//! Rotation policy handlers

use axum::extract::State;
use axum::Json;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{PolicyUpdate, RotationPolicy};

pub async fn get_policy(State(state): State<AppState>) -> Json<RotationPolicy> {
    Json(state.manager.policy())
}

/// Apply a partial update; an invalid merge leaves the policy untouched
pub async fn update_policy(
    State(state): State<AppState>,
    Json(update): Json<PolicyUpdate>,
) -> Result<Json<RotationPolicy>, PoolError> {
    state.manager.update_policy(&update).map(Json)
}
