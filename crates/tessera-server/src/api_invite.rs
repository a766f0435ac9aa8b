//! Third-party invites: storing them for unbound addresses and signing the
//! invite acceptance with the ephemeral key.

use std::sync::Arc;

use axum::{body::Bytes, extract::RawQuery, http::HeaderMap, Extension, Json};
use serde_json::{json, Value};
use tessera_mail::TemplateKind;
use tessera_signing::{ServerKey, SignedJson};
use tessera_store::{associations, invites};
use tessera_types::{now_ms, random_alphanumeric, ErrCode, InviteToken, Medium};
use tracing::{info, warn};

use crate::api::{run_blocking, send_mail, ApiError, Params};
use crate::AppState;

const INVITE_TOKEN_LENGTH: usize = 128;

/// Obscures an address for display: every `@`-separated part keeps at most
/// its first three characters.
pub fn redact_address(address: &str) -> String {
    address
        .split('@')
        .map(|part| {
            let len = part.chars().count();
            let keep = match len {
                n if n > 5 => 3,
                n if n > 1 => 1,
                _ => 0,
            };
            let mut redacted: String = part.chars().take(keep).collect();
            redacted.push_str("...");
            redacted
        })
        .collect::<Vec<_>>()
        .join("@")
}

/// Handler for `POST /_matrix/identity/api/v1/store-invite`.
///
/// Records an invite for an address nobody has bound yet, mints an
/// ephemeral key for it, and emails the invitee.
pub async fn store_invite_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_request(query.as_deref(), &headers, &body)?;
    let [medium, address, room_id, sender] =
        params.require(["medium", "address", "room_id", "sender"])?;
    if medium.parse::<Medium>() != Ok(Medium::Email) {
        return Err(ApiError::bad_request(
            ErrCode::Unrecognized,
            format!("Didn't understand medium '{medium}'"),
        ));
    }

    let now = now_ms();
    let token = random_alphanumeric(INVITE_TOKEN_LENGTH);
    let ephemeral = ServerKey::generate("0");
    let ephemeral_public = ephemeral.public_key_base64();
    let invite = InviteToken {
        id: 0,
        medium: Medium::Email,
        address: address.to_string(),
        room_id: room_id.to_string(),
        sender: sender.to_string(),
        token: token.clone(),
        received_at: now,
        sent_at: None,
    };

    {
        let ephemeral_public = ephemeral_public.clone();
        run_blocking(&state, move |conn| {
            if let Some(existing) =
                associations::lookup_current(conn, invite.medium, &invite.address, now)?
            {
                return Err(ApiError::bad_request(
                    ErrCode::ThreepidInUse,
                    format!(
                        "Binding to {} already exists",
                        existing.association.mxid.unwrap_or_default()
                    ),
                ));
            }
            invites::store_ephemeral_key(conn, &ephemeral_public, now)?;
            invites::store_invite(conn, &invite)?;
            Ok(())
        })
        .await?;
    }

    let address = address.to_string();
    let sender = sender.to_string();
    let mut vars = params.into_map();
    let bracketed_room_name = vars
        .get("room_name")
        .filter(|name| !name.is_empty())
        .map(|name| format!("({name})"))
        .unwrap_or_default();
    vars.insert("bracketed_room_name".into(), bracketed_room_name);
    vars.entry("sender_display_name".into())
        .or_insert_with(|| sender.clone());
    vars.insert("token".into(), token.clone());
    vars.insert("ephemeral_private_key".into(), ephemeral.seed_base64());
    if let Err(e) = send_mail(&state, TemplateKind::Invite, &address, vars).await {
        // The invitee never learns the token, so nothing may redeem these rows.
        let (token, ephemeral_public) = (token.clone(), ephemeral_public.clone());
        run_blocking(&state, move |conn| {
            Ok(invites::discard_invite(conn, &token, &ephemeral_public)?)
        })
        .await?;
        warn!(%sender, "discarded third-party invite after mail failure");
        return Err(e);
    }
    info!(%sender, "stored third-party invite");

    let base = state.client_http_base.trim_end_matches('/');
    let public_key = state.server_key.public_key_base64();
    Ok(Json(json!({
        "token": token,
        "public_key": public_key,
        "public_keys": [
            {
                "public_key": public_key,
                "key_validity_url": format!("{base}/_matrix/identity/api/v1/pubkey/isvalid"),
            },
            {
                "public_key": ephemeral_public,
                "key_validity_url": format!("{base}/_matrix/identity/api/v1/pubkey/ephemeral/isvalid"),
            },
        ],
        "display_name": redact_address(&address),
    })))
}

/// Handler for `POST /_matrix/identity/api/v1/sign-ed25519`.
///
/// Signs `{mxid, sender, token}` with the caller-supplied ephemeral private
/// key so the inviting room can check the invite was accepted.
pub async fn sign_ed25519_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SignedJson>, ApiError> {
    let params = Params::from_request(query.as_deref(), &headers, &body)?;
    let [mxid, token, private_key] = params.require(["mxid", "token", "private_key"])?;

    let key = ServerKey::from_seed_base64(private_key, "0").map_err(|e| {
        ApiError::bad_request(ErrCode::InvalidParam, format!("Invalid private_key: {e}"))
    })?;

    let lookup_token = token.to_string();
    let sender = run_blocking(&state, move |conn| {
        Ok(invites::sender_for_token(conn, &lookup_token)?)
    })
    .await?
    .ok_or_else(|| {
        ApiError::NotFound(ErrCode::Unrecognized, "Didn't recognize token".to_string())
    })?;

    let mut signed = match json!({ "mxid": mxid, "sender": sender, "token": token }) {
        Value::Object(map) => map,
        _ => SignedJson::new(),
    };
    key.sign(&mut signed, &state.server_name)?;
    Ok(Json(signed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_each_address_part() {
        assert_eq!(redact_address("alice.smith@example.org"), "ali...@exa...");
        assert_eq!(redact_address("bob@ex.io"), "b...@e...");
        assert_eq!(redact_address("a@b"), "...@...");
        assert_eq!(redact_address("nobody"), "nob...");
    }
}
