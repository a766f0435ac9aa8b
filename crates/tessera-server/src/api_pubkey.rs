//! Public key publication and validity checks.

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery},
    Extension, Json,
};
use serde_json::{json, Value};
use tessera_store::invites;
use tessera_types::ErrCode;

use crate::api::{run_blocking, ApiError, Params};
use crate::AppState;

/// Handler for `GET /_matrix/identity/api/v1/pubkey/{keyId}`.
pub async fn get_pubkey_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if key_id != state.server_key.key_id() {
        return Err(ApiError::NotFound(
            ErrCode::NotFound,
            format!("The public key '{key_id}' could not be found"),
        ));
    }
    Ok(Json(json!({ "public_key": state.server_key.public_key_base64() })))
}

/// Handler for `GET /_matrix/identity/api/v1/pubkey/isvalid`: whether
/// `public_key` is our long-term key.
pub async fn is_valid_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_query(query.as_deref());
    let [public_key] = params.require(["public_key"])?;
    let valid = public_key == state.server_key.public_key_base64();
    Ok(Json(json!({ "valid": valid })))
}

/// Handler for `GET /_matrix/identity/api/v1/pubkey/ephemeral/isvalid`.
/// Each successful check is counted against the key.
pub async fn ephemeral_is_valid_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_query(query.as_deref());
    let [public_key] = params.require(["public_key"])?;
    let public_key = public_key.to_string();

    let valid = run_blocking(&state, move |conn| {
        Ok(invites::ephemeral_key_is_valid(conn, &public_key)?)
    })
    .await?;
    Ok(Json(json!({ "valid": valid })))
}
