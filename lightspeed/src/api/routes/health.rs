//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::models::{CapabilitiesResponse, HealthResponse};
use crate::api::server::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let pipeline = &state.pipeline;
    let capabilities = pipeline.capabilities();
    let status = if capabilities.encoder.is_some() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        strategy: pipeline.strategy().to_string(),
        active_transfers: pipeline.gate().held(),
        max_concurrent_transfers: pipeline.gate().limit(),
        capabilities: CapabilitiesResponse {
            encoder: capabilities.encoder.clone(),
            extractor: capabilities.extractor.clone(),
        },
    })
}

/// Readiness check - can the service take another transfer right now?
/// Returns HTTP 503 while every gate slot is held.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let gate = state.pipeline.gate();
    if gate.held() < gate.limit() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "at capacity")
    }
}

/// Liveness check - is the service alive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
