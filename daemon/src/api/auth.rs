//! Session rotation handlers. The caller sends an ephemeral RSA public key;
//! we mint a fresh secret for verifying that caller's future requests and
//! return it encrypted to the key.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use tracing::info;

use weft_core::auth::SignedPayload;
use weft_core::types::InitSessionRequest;

use crate::api::{credential, signed_json, unauthorized, ApiError};
use crate::state::AppState;

/// POST /auth/v0/init_session - first rotation from a node that holds no
/// session with us yet, authenticated with the cluster secret.
pub async fn init_session_bootstrap(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = state.manager.ctx();
    let credential = credential(&headers)?;
    ctx.cluster
        .verify(ctx.local_id(), SignedPayload::Bytes(&body), credential)
        .map_err(|_| unauthorized())?;

    let request: InitSessionRequest =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let node = state
        .manager
        .pool()
        .find(&request.node_id)
        .ok_or((StatusCode::NOT_FOUND, "no such registration".to_string()))?;

    let response = node
        .session()
        .accept_rotation(&request)
        .map_err(|_| (StatusCode::BAD_REQUEST, "unusable public key".to_string()))?;
    info!("session established with {} over the bootstrap path", request.node_id);

    let body = serde_json::to_vec(&response)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let authorization = ctx
        .cluster
        .sign(
            ctx.local_id(),
            &request.node_id,
            SignedPayload::Bytes(&body),
            ctx.config.auth.validity_window(),
            ctx.config.auth.early_validity(),
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_json(authorization, body))
}

/// POST /auth/v0/init_session/:node_id - routine rotation, authenticated with
/// the caller's current session.
pub async fn init_session(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let node = state
        .manager
        .pool()
        .find(&node_id)
        .ok_or((StatusCode::NOT_FOUND, "no such registration".to_string()))?;
    let credential = credential(&headers)?;
    node.session()
        .verify_request(SignedPayload::Bytes(&body), credential)
        .map_err(|_| unauthorized())?;

    let request: InitSessionRequest =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if request.node_id != node_id {
        return Err((
            StatusCode::BAD_REQUEST,
            "body node_id does not match path".to_string(),
        ));
    }

    // Replaces the inbound token; the outbound token used to sign the
    // response below is untouched.
    let response = node
        .session()
        .accept_rotation(&request)
        .map_err(|_| (StatusCode::BAD_REQUEST, "unusable public key".to_string()))?;

    let body = serde_json::to_vec(&response)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let authorization = node
        .session()
        .authorization_for_response(node.as_ref(), SignedPayload::Bytes(&body))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_json(authorization, body))
}
