//! Inbound peer replication.

use std::sync::Arc;

use axum::{
    body::Bytes,
    http::{header::CONTENT_TYPE, HeaderMap},
    Extension, Json,
};
use serde_json::{json, Value};
use tessera_replication::{receive, ReplicationPayload};
use tessera_store::peers;
use tessera_types::ErrCode;

use crate::api::{run_blocking, ApiError};
use crate::middleware::PeerIdentity;
use crate::AppState;

/// Handler for `POST /_matrix/identity/replicate/v1/push`.
///
/// The caller is identified solely by its client certificate. Every
/// signature in the batch is checked against the peer's registered keys
/// before anything is stored; one bad entry rejects the whole batch.
pub async fn push_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(PeerIdentity(peer_name)): Extension<PeerIdentity>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(peer_name) = peer_name else {
        return Err(ApiError::Forbidden(
            ErrCode::UnknownPeer,
            "This endpoint requires a client certificate".to_string(),
        ));
    };

    let peer = {
        let peer_name = peer_name.clone();
        run_blocking(&state, move |conn| Ok(peers::get_peer_by_name(conn, &peer_name)?))
            .await?
    }
    .ok_or_else(|| {
        ApiError::Forbidden(ErrCode::UnknownPeer, format!("Unknown peer {peer_name}"))
    })?;

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return Err(ApiError::bad_request(
            ErrCode::NotJson,
            "This endpoint expects JSON",
        ));
    }
    let payload: ReplicationPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(ErrCode::BadJson, format!("Malformed JSON: {e}")))?;

    run_blocking(&state, move |conn| Ok(receive(conn, &peer, &payload)?)).await?;
    Ok(Json(json!({ "success": true })))
}
