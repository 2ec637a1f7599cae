pub mod auth;
pub mod control;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use weft_core::error::RegistrationError;
use weft_core::types::HealthResponse;

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and observability
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Mesh control surface
        .route("/control/v0/node_info", get(control::node_info))
        .route(
            "/control/v0/registrations/register",
            post(control::register_bootstrap),
        )
        .route(
            "/control/v0/registrations/register/:node_id",
            post(control::register),
        )
        .route("/control/v0/packet/rx/:node_id", post(control::packet_rx))
        .route(
            "/control/v0/packet/rx/:node_id/batch",
            post(control::packet_rx_batch),
        )
        // Session rotation
        .route("/auth/v0/init_session", post(auth::init_session_bootstrap))
        .route("/auth/v0/init_session/:node_id", post(auth::init_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - 503 once registrations or the tunnel loop degrade, so an
/// external supervisor can restart the daemon.
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.manager.health();
    let status = if health.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /metrics - Prometheus text exposition
async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.manager.metrics().encode()
}

pub(crate) type ApiError = (StatusCode, String);

pub(crate) fn unauthorized() -> ApiError {
    (StatusCode::UNAUTHORIZED, "authentication failed".to_string())
}

/// The request's Authorization header, which carries the signed claims for
/// the body.
pub(crate) fn credential(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)
}

/// JSON response carrying our mutual-auth signature over the exact body
/// bytes.
pub(crate) fn signed_json(authorization: String, body: Vec<u8>) -> Response {
    (
        [
            (header::AUTHORIZATION, authorization),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Empty 204 that still carries our mutual-auth signature, computed over the
/// empty body, so packet acknowledgements verify like every other response.
pub(crate) fn signed_no_content(authorization: String) -> Response {
    (
        StatusCode::NO_CONTENT,
        [(header::AUTHORIZATION, authorization)],
    )
        .into_response()
}

pub(crate) fn registration_error(e: RegistrationError) -> ApiError {
    match e {
        // A node talking to itself, usually through a misconfigured load
        // balancer or seed list.
        RegistrationError::FromSelf => (StatusCode::MISDIRECTED_REQUEST, e.to_string()),
        RegistrationError::Failed(_) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}
