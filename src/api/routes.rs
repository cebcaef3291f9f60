//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/status", get(handlers::health::status))
        .nest("/api/pool", pool_routes())
        .with_state(state)
}

fn pool_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(handlers::pool::get_stats))
        // Endpoints
        .route(
            "/endpoints",
            get(handlers::pool::list_endpoints).post(handlers::pool::add_endpoint),
        )
        .route(
            "/endpoints/quarantine",
            post(handlers::pool::quarantine_endpoint),
        )
        .route(
            "/endpoints/unquarantine",
            post(handlers::pool::unquarantine_endpoint),
        )
        .route("/endpoints/probe", post(handlers::pool::probe_endpoint))
        .route("/quarantine/clear", post(handlers::pool::clear_quarantine))
        .route("/refresh", post(handlers::pool::refresh_providers))
        .route("/reset", post(handlers::pool::reset_pool))
        // Consumers
        .route("/acquire", post(handlers::pool::acquire))
        .route("/release", post(handlers::pool::release))
        .route("/report", post(handlers::pool::report))
        .route("/rotate", post(handlers::pool::rotate))
        .route("/lease/check", post(handlers::pool::check_lease))
        .route("/consumers/remove", post(handlers::pool::remove_consumer))
        // Policy
        .route(
            "/policy",
            get(handlers::policy::get_policy).put(handlers::policy::update_policy),
        )
}
