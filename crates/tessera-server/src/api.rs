//! Shared request plumbing: the error type, parameter intake, blocking
//! database access, and mail delivery.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::CONTENT_TYPE, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tessera_mail::{compose, TemplateKind};
use tessera_replication::ReplicationError;
use tessera_signing::SigningError;
use tessera_store::{SessionError, StoreError};
use tessera_types::{ErrCode, Medium};
use thiserror::Error;
use tracing::warn;

use crate::AppState;

/// Errors returned by handlers, rendered as `{errcode, error}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}: {1}")]
    BadRequest(ErrCode, String),
    #[error("{0}: {1}")]
    Unauthorized(ErrCode, String),
    #[error("{0}: {1}")]
    Forbidden(ErrCode, String),
    #[error("{0}: {1}")]
    NotFound(ErrCode, String),
    /// A replication batch was rejected; carries the failing origin IDs.
    #[error("verification failed for origin IDs {0:?}")]
    VerificationFailed(Vec<i64>),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

/// The full error text, attached to error responses so the logging
/// middleware can report it next to the method and path.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

impl ApiError {
    pub fn bad_request(errcode: ErrCode, message: impl Into<String>) -> Self {
        Self::BadRequest(errcode, message.into())
    }

    /// `M_MISSING_PARAM` naming every absent parameter.
    pub fn missing_params(names: &[&str]) -> Self {
        Self::BadRequest(
            ErrCode::MissingParam,
            format!("Missing parameters: {}", names.join(",")),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = ErrorDetail(self.to_string());
        let (status, body) = match self {
            ApiError::BadRequest(code, msg) => (StatusCode::BAD_REQUEST, error_body(code, &msg)),
            ApiError::Unauthorized(code, msg) => (StatusCode::UNAUTHORIZED, error_body(code, &msg)),
            ApiError::Forbidden(code, msg) => (StatusCode::FORBIDDEN, error_body(code, &msg)),
            ApiError::NotFound(code, msg) => (StatusCode::NOT_FOUND, error_body(code, &msg)),
            ApiError::VerificationFailed(failed) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "errcode": ErrCode::VerificationFailed,
                    "error": "Verification failed for one or more associations",
                    "failed_ids": failed,
                }),
            ),
            ApiError::InternalServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body(ErrCode::Unknown, "Internal server error"),
            ),
        };

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(detail);
        response
    }
}

fn error_body(errcode: ErrCode, message: &str) -> Value {
    json!({ "errcode": errcode, "error": message })
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::InternalServerError(e.to_string())
    }
}

impl From<SigningError> for ApiError {
    fn from(e: SigningError) -> Self {
        Self::InternalServerError(e.to_string())
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        Self::InternalServerError(format!("database error: {e}"))
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(e: r2d2::Error) -> Self {
        Self::InternalServerError(format!("db connection failed: {e}"))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::InternalServerError(format!("blocking task failed: {e}"))
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => Self::bad_request(
                ErrCode::NoValidSession,
                "No valid session was found matching that sid and client secret",
            ),
            SessionError::IncorrectClientSecret => Self::bad_request(
                ErrCode::IncorrectClientSecret,
                "Client secret does not match the one given when requesting the token",
            ),
            SessionError::SessionExpired => Self::bad_request(
                ErrCode::SessionExpired,
                "This validation session has expired: call requestToken again",
            ),
            SessionError::IncorrectToken => {
                Self::bad_request(ErrCode::Unrecognized, "Token does not match")
            }
            SessionError::SessionNotValidated => Self::bad_request(
                ErrCode::SessionNotValidated,
                "This validation session has not yet been completed",
            ),
            SessionError::Store(e) => e.into(),
        }
    }
}

impl From<ReplicationError> for ApiError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::VerificationFailed { failed } => Self::VerificationFailed(failed),
            ReplicationError::Json(e) => {
                Self::bad_request(ErrCode::BadJson, format!("Malformed association: {e}"))
            }
            other => Self::InternalServerError(other.to_string()),
        }
    }
}

/// Runs `f` with a pooled connection on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, ApiError> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

/// Parses a body that must be a JSON object.
pub(crate) fn json_object(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::bad_request(
            ErrCode::BadJson,
            "Body must be a JSON object",
        )),
        Err(e) => Err(ApiError::bad_request(
            ErrCode::BadJson,
            format!("Malformed JSON: {e}"),
        )),
    }
}

pub(crate) fn parse_medium(raw: &str) -> Result<Medium, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(ErrCode::InvalidParam, format!("Unknown medium '{raw}'")))
}

pub(crate) fn parse_sid(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(ErrCode::InvalidParam, "sid must be an integer"))
}

/// Request parameters gathered from the body and the query string.
///
/// JSON and form bodies are both accepted; body values win over query
/// values of the same name. Non-string JSON scalars are kept in their JSON
/// spelling; nested values are ignored.
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn from_request(
        query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Self, ApiError> {
        let mut values = HashMap::new();

        if !body.is_empty() {
            let is_form = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            if is_form {
                values.extend(url::form_urlencoded::parse(body).into_owned());
            } else {
                for (name, value) in json_object(body)? {
                    let value = match value {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => continue,
                    };
                    values.insert(name, value);
                }
            }
        }

        if let Some(query) = query {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()).into_owned() {
                values.entry(name).or_insert(value);
            }
        }
        Ok(Self(values))
    }

    /// Query-string parameters only.
    pub fn from_query(query: Option<&str>) -> Self {
        Self(
            query
                .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
                .unwrap_or_default(),
        )
    }

    /// A non-empty parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Returns every named parameter, or `M_MISSING_PARAM` listing the
    /// absent ones.
    pub fn require<const N: usize>(&self, names: [&str; N]) -> Result<[&str; N], ApiError> {
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| self.get(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::missing_params(&missing));
        }
        Ok(names.map(|name| self.get(name).unwrap_or_default()))
    }

    pub fn into_map(self) -> HashMap<String, String> {
        self.0
    }
}

/// Address of the client, preferring the first `X-Forwarded-For` hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_default();
        Ok(Self(ip))
    }
}

/// Renders `kind` for `to` and hands it to the configured mailer.
pub(crate) async fn send_mail(
    state: &AppState,
    kind: TemplateKind,
    to: &str,
    vars: HashMap<String, String>,
) -> Result<(), ApiError> {
    let recipients = vec![to.to_string()];
    let message = compose(
        state.templates.get(kind),
        &state.email_from,
        &recipients,
        state.mailer.hostname(),
        Utc::now(),
        vars,
    );
    state
        .mailer
        .send(&state.email_from, &recipients, &message)
        .await
        .map_err(|e| {
            warn!(error = %e, ?kind, "mail delivery failed");
            ApiError::bad_request(ErrCode::EmailSendError, "Failed to send email")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn params_merge_body_over_query() {
        let params = Params::from_request(
            Some("sid=1&client_secret=query"),
            &HeaderMap::new(),
            br#"{"client_secret": "body", "send_attempt": 2, "nested": {"a": 1}}"#,
        )
        .unwrap();
        assert_eq!(params.get("sid"), Some("1"));
        assert_eq!(params.get("client_secret"), Some("body"));
        assert_eq!(params.get("send_attempt"), Some("2"));
        assert_eq!(params.get("nested"), None);
    }

    #[test]
    fn params_read_form_bodies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let params =
            Params::from_request(None, &headers, b"email=a%40example.org&sid=4").unwrap();
        assert_eq!(params.get("email"), Some("a@example.org"));
    }

    #[test]
    fn require_lists_every_missing_name() {
        let params = Params::from_query(Some("sid=1&mxid="));
        let err = params.require(["sid", "client_secret", "mxid"]).unwrap_err();
        match err {
            ApiError::BadRequest(ErrCode::MissingParam, msg) => {
                assert_eq!(msg, "Missing parameters: client_secret,mxid")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let [sid] = params.require(["sid"]).unwrap();
        assert_eq!(sid, "1");
    }

    #[test]
    fn malformed_json_is_bad_json() {
        let err = Params::from_request(None, &HeaderMap::new(), b"{nope").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ErrCode::BadJson, _)));
    }

    #[test]
    fn internal_errors_do_not_leak() {
        let response = ApiError::InternalServerError("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert!(detail.0.contains("disk on fire"));
    }
}
