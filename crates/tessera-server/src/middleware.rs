use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::api::ErrorDetail;
use crate::AppState;

/// Server name from the verified client certificate of the caller, if any.
///
/// TLS is terminated in front of this process; the front end verifies the
/// peer certificate and forwards its subject CN in the configured header
/// (`server.peer_cert_header`). The front end must strip that header from
/// requests that did not present a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity(pub Option<String>);

/// Copies the forwarded certificate CN into a [`PeerIdentity`] extension.
pub async fn peer_identity_middleware(
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let common_name = req
        .headers()
        .get(state.peer_cert_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    req.extensions_mut().insert(PeerIdentity(common_name));

    Ok(next.run(req).await)
}

/// Logs every handler error with the request method and path.
pub async fn log_errors_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    if let Some(ErrorDetail(detail)) = response.extensions().get::<ErrorDetail>() {
        let status = response.status().as_u16();
        if response.status().is_server_error() {
            tracing::error!(%method, %path, status, error = %detail, "request failed");
        } else {
            tracing::warn!(%method, %path, status, error = %detail, "request rejected");
        }
    }
    response
}
