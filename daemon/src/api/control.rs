//! Registration and packet ingress handlers.
//!
//! Every POST here authenticates the raw body bytes against either the
//! caller's session or, on the bootstrap path, the cluster secret, and signs
//! its own response body the same way. The `:node_id` path segment is always
//! the CALLER's node id; it selects which session verifies the request.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use tracing::{debug, info, warn};

use weft_core::auth::SignedPayload;
use weft_core::codec::{Packet, PacketJson};
use weft_core::types::{NodeInfoSummary, Registration};

use crate::api::{
    credential, registration_error, signed_json, signed_no_content, unauthorized, ApiError,
};
use crate::state::AppState;

/// GET /control/v0/node_info - unauthenticated identity lookup
pub async fn node_info(State(state): State<Arc<AppState>>) -> Json<NodeInfoSummary> {
    let local = state.manager.local();
    Json(NodeInfoSummary {
        id: local.id.clone(),
        listen_url: local.listen_url.clone(),
    })
}

/// POST /control/v0/registrations/register - cluster-authenticated
/// registration from a node we have no session with yet.
///
/// The caller's identity is resolved independently by asking the advertised
/// listen URL who it is; a mismatch with the claimed id rejects the
/// registration.
pub async fn register_bootstrap(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = state.manager.ctx();
    let credential = credential(&headers)?;
    ctx.cluster
        .verify(ctx.local_id(), SignedPayload::Bytes(&body), credential)
        .map_err(|_| unauthorized())?;

    let registration: Registration =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let claimed = registration.local.id.clone();

    let resolved = ctx
        .new_client(&registration.local.listen_url)
        .node_info()
        .await
        .map_err(|e| {
            warn!("could not resolve registering node {}: {}", claimed, e);
            (
                StatusCode::BAD_REQUEST,
                "advertised listen URL is unreachable".to_string(),
            )
        })?;

    let response = state
        .manager
        .registrations()
        .process_registration(registration, Some(&resolved.id))
        .map_err(registration_error)?;
    info!("node {} registered over the bootstrap path", claimed);

    let body = serde_json::to_vec(&response)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let authorization = ctx
        .cluster
        .sign(
            ctx.local_id(),
            &claimed,
            SignedPayload::Bytes(&body),
            ctx.config.auth.validity_window(),
            ctx.config.auth.early_validity(),
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_json(authorization, body))
}

/// POST /control/v0/registrations/register/:node_id - session-authenticated
/// re-registration from a known peer.
pub async fn register(
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

    let registration: Registration =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let response = state
        .manager
        .registrations()
        .process_registration(registration, Some(&node_id))
        .map_err(registration_error)?;
    debug!("node {} re-registered", node_id);

    let body = serde_json::to_vec(&response)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let authorization = node
        .session()
        .authorization_for_response(node.as_ref(), SignedPayload::Bytes(&body))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_json(authorization, body))
}

/// POST /control/v0/packet/rx/:node_id - one tunneled packet from a peer.
pub async fn packet_rx(
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

    let json: PacketJson =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let packet =
        Packet::from_json(&json).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    // The credential signs the packet's own digest rather than the HTTP body,
    // so it survives any re-encoding of the JSON document.
    node.session()
        .verify_request(SignedPayload::Packet(&packet), credential)
        .map_err(|_| unauthorized())?;

    // The routing layer trusts only the session-authenticated caller id, not
    // whatever origin the packet claims.
    state.manager.router().route_remote(packet, &node_id).await;

    let authorization = node
        .session()
        .authorization_for_response(node.as_ref(), SignedPayload::Bytes(b""))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_no_content(authorization))
}

/// POST /control/v0/packet/rx/:node_id/batch - several packets in one call,
/// authenticated over the raw body.
pub async fn packet_rx_batch(
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

    let docs: Vec<String> =
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    for doc in docs {
        // The body as a whole is authenticated; an undecodable entry only
        // drops that entry.
        match serde_json::from_str::<PacketJson>(&doc)
            .map_err(|_| ())
            .and_then(|json| Packet::from_json(&json).map_err(|_| ()))
        {
            Ok(packet) => state.manager.router().route_remote(packet, &node_id).await,
            Err(()) => {
                warn!("undecodable packet in batch from {}", node_id);
                state
                    .manager
                    .metrics()
                    .drop_packet(weft_core::metrics::DropReason::Malformed);
            }
        }
    }

    let authorization = node
        .session()
        .authorization_for_response(node.as_ref(), SignedPayload::Bytes(b""))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(signed_no_content(authorization))
}
