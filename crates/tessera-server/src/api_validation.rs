//! Email validation sessions: `requestToken`, `submitToken`, and
//! `getValidated3pid`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::RawQuery,
    http::{header::LOCATION, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use serde_json::{json, Value};
use tessera_mail::{render, validation_link, with_variants, TemplateKind};
use tessera_store::{sessions, SessionError};
use tessera_types::{now_ms, ErrCode, Medium};
use tracing::{debug, info};

use crate::api::{parse_sid, run_blocking, send_mail, ApiError, ClientIp, Params};
use crate::AppState;

const VERIFY_SUCCESS: &str =
    "Verification successful! Please return to your Matrix client to continue.";
const VERIFY_FAILURE: &str =
    "Verification failed: you may need to request another verification email";

/// Accepts `local@domain.tld`: one `@`, no whitespace, and a dotted domain.
fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !address.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        && !domain.ends_with('.')
}

/// `next_link`, or the legacy `nextLink`, unless it points at a local file.
fn next_link(params: &Params) -> Option<&str> {
    params
        .get("next_link")
        .or_else(|| params.get("nextLink"))
        .filter(|link| !link.starts_with("file:///"))
}

/// Handler for `POST /_matrix/identity/api/v1/validate/email/requestToken`.
///
/// Sends at most one message per `send_attempt`: repeating an attempt
/// number already delivered returns the same `sid` without mailing again.
pub async fn request_email_token_handler(
    Extension(state): Extension<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_request(query.as_deref(), &headers, &body)?;
    let [email, client_secret, send_attempt] =
        params.require(["email", "client_secret", "send_attempt"])?;
    let send_attempt: i64 = send_attempt.parse().map_err(|_| {
        ApiError::bad_request(ErrCode::InvalidParam, "send_attempt must be an integer")
    })?;
    if !is_valid_email(email) {
        return Err(ApiError::bad_request(
            ErrCode::InvalidEmail,
            "Invalid email address",
        ));
    }
    let next_link = next_link(&params);
    if let Some(link) = next_link {
        url::Url::parse(link).map_err(|e| {
            ApiError::bad_request(ErrCode::InvalidParam, format!("Invalid next_link: {e}"))
        })?;
    }

    let request = {
        let (email, client_secret) = (email.to_string(), client_secret.to_string());
        run_blocking(&state, move |conn| {
            Ok(sessions::begin_token_request(
                conn,
                Medium::Email,
                &email,
                &client_secret,
                send_attempt,
                now_ms(),
            )?)
        })
        .await?
    };
    let sid = request.session.id;

    if request.should_send {
        let link = validation_link(
            &state.client_http_base,
            sid,
            &request.session.token,
            client_secret,
            next_link,
        )
        .map_err(|e| ApiError::InternalServerError(format!("validation link: {e}")))?;
        let vars = HashMap::from([
            ("token".to_string(), request.session.token.clone()),
            ("link".to_string(), link),
            ("ipaddress".to_string(), ip),
        ]);
        send_mail(&state, TemplateKind::Verification, email, vars).await?;

        run_blocking(&state, move |conn| {
            Ok(sessions::record_send_attempt(conn, sid, send_attempt)?)
        })
        .await?;
        info!(sid, send_attempt, "sent validation email");
    } else {
        debug!(sid, send_attempt, "send attempt already delivered");
    }

    Ok(Json(json!({ "success": true, "sid": sid.to_string() })))
}

/// Runs `submitToken`; `Ok(false)` for every session-level rejection.
async fn try_submit(state: &AppState, params: &Params) -> Result<bool, ApiError> {
    let [sid, client_secret, token] = params.require(["sid", "client_secret", "token"])?;
    let sid = parse_sid(sid)?;
    let (client_secret, token) = (client_secret.to_string(), token.to_string());

    run_blocking(state, move |conn| {
        match sessions::submit_token(conn, sid, &client_secret, &token, now_ms()) {
            Ok(_) => {
                info!(sid, "validation session completed");
                Ok(true)
            }
            Err(SessionError::Store(e)) => Err(e.into()),
            Err(e) => {
                debug!(sid, error = %e, "token submission rejected");
                Ok(false)
            }
        }
    })
    .await
}

/// Handler for `POST /_matrix/identity/api/v1/validate/email/submitToken`.
pub async fn submit_token_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_request(query.as_deref(), &headers, &body)?;
    let success = try_submit(&state, &params).await?;
    Ok(Json(json!({ "success": success })))
}

/// Handler for `GET /_matrix/identity/api/v1/validate/email/submitToken`,
/// the target of the emailed link.
///
/// On success with a `nextLink`, redirects there; otherwise renders the
/// verification result page.
pub async fn submit_token_page_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let params = Params::from_query(query.as_deref());
    let success = try_submit(&state, &params).await?;

    if success {
        if let Some(next) = next_link(&params) {
            return Ok((StatusCode::FOUND, [(LOCATION, next.to_string())]).into_response());
        }
    }

    let message = if success { VERIFY_SUCCESS } else { VERIFY_FAILURE };
    let vars = with_variants(HashMap::from([("message".to_string(), message.to_string())]));
    let page = render(state.templates.get(TemplateKind::VerifyResponse), &vars);
    Ok(Html(page).into_response())
}

/// Handler for `GET /_matrix/identity/api/v1/3pid/getValidated3pid`.
pub async fn get_validated_3pid_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, ApiError> {
    let params = Params::from_query(query.as_deref());
    let [sid, client_secret] = params.require(["sid", "client_secret"])?;
    let sid = parse_sid(sid)?;
    let client_secret = client_secret.to_string();

    let session = run_blocking(&state, move |conn| {
        Ok(sessions::get_validated_session(
            conn,
            sid,
            &client_secret,
            now_ms(),
        )?)
    })
    .await?;

    Ok(Json(json!({
        "medium": session.medium,
        "address": session.address,
        "validated_at": session.mtime,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape_is_checked() {
        assert!(is_valid_email("alice@example.org"));
        assert!(is_valid_email("a.b+c@mail.example.co.uk"));
        assert!(!is_valid_email("alice"));
        assert!(!is_valid_email("alice@localhost"));
        assert!(!is_valid_email("@example.org"));
        assert!(!is_valid_email("a@b@example.org"));
        assert!(!is_valid_email("al ice@example.org"));
        assert!(!is_valid_email("alice@.org"));
        assert!(!is_valid_email("alice@example."));
    }

    #[test]
    fn file_next_links_are_dropped() {
        let params = Params::from_query(Some("nextLink=file%3A%2F%2F%2Fetc%2Fpasswd"));
        assert_eq!(next_link(&params), None);
        let params = Params::from_query(Some("next_link=https%3A%2F%2Fclient.example%2Fdone"));
        assert_eq!(next_link(&params), Some("https://client.example/done"));
    }
}
