//! API route modules.

pub mod health;
pub mod transfers;

use axum::Router;

use crate::api::server::AppState;

/// Transfer submission under `/api`.
pub fn transfer_routes() -> Router<AppState> {
    Router::new().nest("/api", transfers::router())
}

/// Liveness and readiness probes under `/health`.
pub fn health_routes() -> Router<AppState> {
    Router::new().nest("/health", health::router())
}

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    transfer_routes().merge(health_routes()).with_state(state)
}
