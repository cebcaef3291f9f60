//! Pool handlers: consumers, endpoints and providers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{Endpoint, LeaseOutcome, PoolStats, ProxyLease, RefreshReport};
use crate::pool::ProbeResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRequest {
    #[serde(alias = "consumer_id")]
    pub consumer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    #[serde(alias = "consumer_id")]
    pub consumer_id: String,
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct AddEndpointRequest {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn lease_or_exhausted(outcome: LeaseOutcome) -> Result<Json<ProxyLease>, PoolError> {
    outcome.into_result().map(Json)
}

pub async fn get_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.manager.get_stats())
}

pub async fn list_endpoints(State(state): State<AppState>) -> Json<Vec<Endpoint>> {
    Json(state.manager.export_snapshot())
}

pub async fn add_endpoint(
    State(state): State<AppState>,
    Json(req): Json<AddEndpointRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let address = state.manager.add_custom_proxy(
        &req.host,
        req.port,
        req.username.as_deref(),
        req.password.as_deref(),
    )?;

    Ok((StatusCode::CREATED, Json(json!({ "address": address }))))
}

pub async fn quarantine_endpoint(
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let changed = state.manager.quarantine(&req.address)?;
    Ok(Json(json!({ "address": req.address, "changed": changed })))
}

pub async fn unquarantine_endpoint(
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let changed = state.manager.unquarantine(&req.address)?;
    Ok(Json(json!({ "address": req.address, "changed": changed })))
}

pub async fn probe_endpoint(
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<ProbeResult>, PoolError> {
    state.manager.probe(&req.address).await.map(Json)
}

pub async fn clear_quarantine(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.manager.clear_quarantine();
    Json(json!({ "cleared": cleared }))
}

pub async fn refresh_providers(State(state): State<AppState>) -> Json<RefreshReport> {
    Json(state.manager.refresh_from_providers().await)
}

/// 503 `{"error": "exhausted"}` when nothing is eligible
pub async fn acquire(
    State(state): State<AppState>,
    Json(req): Json<ConsumerRequest>,
) -> Result<Json<ProxyLease>, PoolError> {
    let outcome = state.manager.acquire_proxy(&req.consumer_id)?;
    lease_or_exhausted(outcome)
}

pub async fn release(
    State(state): State<AppState>,
    Json(req): Json<ConsumerRequest>,
) -> Result<impl IntoResponse, PoolError> {
    state.manager.release_proxy(&req.consumer_id)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn report(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Result<impl IntoResponse, PoolError> {
    let recorded = state.manager.report_outcome(&req.consumer_id, req.success)?;
    Ok(Json(json!({ "ok": true, "recorded": recorded })))
}

pub async fn rotate(
    State(state): State<AppState>,
    Json(req): Json<ConsumerRequest>,
) -> Result<Json<ProxyLease>, PoolError> {
    let outcome = state.manager.rotate_proxy(&req.consumer_id)?;
    lease_or_exhausted(outcome)
}

pub async fn remove_consumer(
    State(state): State<AppState>,
    Json(req): Json<ConsumerRequest>,
) -> Result<impl IntoResponse, PoolError> {
    if req.consumer_id.trim().is_empty() {
        return Err(PoolError::InvalidRequest("consumerId must not be empty".into()));
    }
    let removed = state.manager.remove_consumer(&req.consumer_id);
    Ok(Json(json!({ "consumerId": req.consumer_id, "removed": removed })))
}

/// Whether a previously issued lease is still the consumer's live binding
pub async fn check_lease(
    State(state): State<AppState>,
    Json(lease): Json<ProxyLease>,
) -> impl IntoResponse {
    let current = state.manager.is_lease_current(&lease);
    Json(json!({ "current": current }))
}

pub async fn reset_pool(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.manager.reset_pool();
    Json(json!({ "removed": removed }))
}
