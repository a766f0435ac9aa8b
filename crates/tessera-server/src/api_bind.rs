//! Binding and unbinding third-party identifiers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{OriginalUri, RawQuery},
    http::{header::AUTHORIZATION, HeaderMap},
    Extension, Json,
};
use serde_json::{json, Value};
use tessera_federation::{XMatrixAuth, XMatrixError};
use rusqlite::TransactionBehavior;
use tessera_replication::{attach_invites, publish_local, sign_association};
use tessera_signing::SignedJson;
use tessera_store::{associations, invites, sessions};
use tessera_types::{now_ms, Association, ErrCode};
use tracing::{info, warn};

use crate::api::{json_object, parse_medium, parse_sid, run_blocking, ApiError, Params};
use crate::AppState;

/// Handler for `POST /_matrix/identity/api/v1/bind`.
///
/// Binds the address proven by a validated session to `mxid`, attaching
/// any invites waiting for that address, and returns the signed
/// association. The binding is published to our own global table before
/// returning so an immediate lookup sees it.
pub async fn bind_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SignedJson>, ApiError> {
    let params = Params::from_request(query.as_deref(), &headers, &body)?;
    let [sid, client_secret, mxid] = params.require(["sid", "client_secret", "mxid"])?;
    let sid = parse_sid(sid)?;
    let (client_secret, mxid) = (client_secret.to_string(), mxid.to_string());
    let key = state.server_key.clone();
    let server_name = state.server_name.clone();

    let (signed, invites_attached) = run_blocking(&state, move |conn| {
        let now = now_ms();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = sessions::get_validated_session(&tx, sid, &client_secret, now)?;

        let mut association = Association::new_binding(session.medium, &session.address, &mxid, now);
        let pending = invites::pending_invites(&tx, session.medium, &session.address)?;
        attach_invites(&key, &server_name, &mut association, &pending)?;

        association.id = associations::local_upsert(&tx, &association)?;
        invites::mark_invites_sent(&tx, session.medium, &session.address, now)?;
        publish_local(&tx, &key, &server_name)?;
        tx.commit()?;

        Ok((sign_association(&key, &server_name, &association)?, pending.len()))
    })
    .await?;

    info!(sid, invites = invites_attached, "bound third-party identifier");
    Ok(Json(signed))
}

/// Handler for `POST /_matrix/identity/api/v1/unbind`.
///
/// Only the homeserver that owns `mxid` may unbind it: the request must be
/// signed with an `X-Matrix` header whose origin is the mxid's server.
pub async fn unbind_handler(
    Extension(state): Extension<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let content = json_object(&body)?;
    let threepid = content.get("threepid").and_then(Value::as_object);
    let medium = threepid
        .and_then(|t| t.get("medium"))
        .and_then(Value::as_str);
    let address = threepid
        .and_then(|t| t.get("address"))
        .and_then(Value::as_str);
    let mxid = content.get("mxid").and_then(Value::as_str);
    let (Some(medium), Some(address), Some(mxid)) = (medium, address, mxid) else {
        let mut missing = Vec::new();
        if medium.is_none() || address.is_none() {
            missing.push("threepid");
        }
        if mxid.is_none() {
            missing.push("mxid");
        }
        return Err(ApiError::missing_params(&missing));
    };
    let medium = parse_medium(medium)?;

    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let auth = XMatrixAuth::parse(header)
        .map_err(|e| ApiError::Unauthorized(ErrCode::Forbidden, e.to_string()))?;

    let keys = state.key_cache.get(&auth.origin).await.map_err(|e| {
        warn!(origin = %auth.origin, error = %e, "could not fetch signing keys");
        ApiError::Unauthorized(
            ErrCode::Forbidden,
            "Failed to retrieve verification keys".to_string(),
        )
    })?;

    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let request = auth.signed_request(
        "POST",
        &path_and_query,
        &state.server_name,
        Value::Object(content.clone()),
    );
    auth.verify(&keys, &request).map_err(|e| match e {
        XMatrixError::UnknownKey { .. } => ApiError::Unauthorized(
            ErrCode::Forbidden,
            "No matching signature found".to_string(),
        ),
        other => ApiError::Unauthorized(ErrCode::Forbidden, other.to_string()),
    })?;

    if !mxid.ends_with(&format!(":{}", auth.origin)) {
        return Err(ApiError::Forbidden(
            ErrCode::Forbidden,
            "Origin server name does not match mxid".to_string(),
        ));
    }

    let (address, mxid) = (address.to_string(), mxid.to_string());
    let key = state.server_key.clone();
    let server_name = state.server_name.clone();
    let origin = auth.origin.clone();
    run_blocking(&state, move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = associations::local_remove(&tx, medium, &address, &mxid, now_ms())?;
        if removed {
            publish_local(&tx, &key, &server_name)?;
        }
        tx.commit()?;
        if removed {
            info!(%origin, %medium, "unbound third-party identifier");
        }
        Ok(())
    })
    .await?;

    Ok(Json(json!({})))
}
