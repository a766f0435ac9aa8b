//! Association lookup, single and bulk.

use std::sync::Arc;

use axum::{body::Bytes, extract::RawQuery, Extension, Json};
use serde_json::{json, Value};
use tessera_signing::{ServerKey, SignedJson};
use tessera_store::associations;
use tessera_types::{now_ms, ErrCode};

use crate::api::{json_object, parse_medium, run_blocking, ApiError, Params};
use crate::AppState;

/// Handler for `GET /_matrix/identity/api/v1/lookup`.
///
/// Returns the newest current association for `(medium, address)`. The
/// stored signed JSON is returned untouched when we already signed it;
/// otherwise a copy gains our signature.
pub async fn lookup_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<SignedJson>, ApiError> {
    let params = Params::from_query(query.as_deref());
    let [medium, address] = params.require(["medium", "address"])?;
    let medium = parse_medium(medium)?;
    let address = address.to_string();

    let record = run_blocking(&state, move |conn| {
        Ok(associations::lookup_current(conn, medium, &address, now_ms())?)
    })
    .await?
    .ok_or_else(|| ApiError::NotFound(ErrCode::NotFound, "No match found".to_string()))?;

    let mut signed = record.signed;
    if !ServerKey::is_signed_by(&signed, &state.server_name) {
        state.server_key.sign(&mut signed, &state.server_name)?;
    }
    Ok(Json(signed))
}

/// Handler for `POST /_matrix/identity/api/v1/bulk_lookup`.
///
/// Body `{threepids: [[medium, address], ...]}`; answers with the bound
/// pairs as `[medium, address, mxid]` in request order.
pub async fn bulk_lookup_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = json_object(&body)?;
    let threepids = body
        .get("threepids")
        .ok_or_else(|| ApiError::missing_params(&["threepids"]))?
        .as_array()
        .ok_or_else(|| ApiError::bad_request(ErrCode::InvalidParam, "threepids must be a list"))?;

    let pairs = threepids
        .iter()
        .map(|item| match item.as_array().map(Vec::as_slice) {
            Some([Value::String(medium), Value::String(address)]) => {
                Ok((medium.clone(), address.clone()))
            }
            _ => Err(ApiError::bad_request(
                ErrCode::InvalidParam,
                "each threepid must be a [medium, address] pair",
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let found = run_blocking(&state, move |conn| {
        Ok(associations::bulk_lookup(conn, &pairs, now_ms())?)
    })
    .await?;

    let threepids: Vec<[String; 3]> = found
        .into_iter()
        .map(|(medium, address, mxid)| [medium, address, mxid])
        .collect();
    Ok(Json(json!({ "threepids": threepids })))
}
