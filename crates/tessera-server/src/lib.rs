//! HTTP surface of the Tessera identity service.
//!
//! Handlers are grouped by concern (`api_lookup`, `api_validation`,
//! `api_bind`, `api_invite`, `api_pubkey`, `api_replication`). Each pulls the
//! shared [`AppState`] from an `Extension` and runs database work on the
//! blocking pool.

pub mod api;
pub mod api_bind;
pub mod api_invite;
pub mod api_lookup;
pub mod api_pubkey;
pub mod api_replication;
pub mod api_validation;
pub mod background;
pub mod config;
pub mod middleware;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tessera_db::DbPool;
use tessera_federation::KeyCache;
use tessera_mail::{Mailer, Templates};
use tessera_signing::ServerKey;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Largest request body accepted on any route.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared by every handler.
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Long-term signing key.
    pub server_key: ServerKey,
    /// Our server name, used as the signing and replication origin.
    pub server_name: String,
    /// Public base URL for links we hand out.
    pub client_http_base: String,
    /// Header carrying the verified client certificate CN.
    pub peer_cert_header: String,
    /// Sender address on outgoing mail.
    pub email_from: String,
    pub mailer: Arc<dyn Mailer>,
    pub templates: Arc<Templates>,
    /// Signing keys of homeservers that call `unbind`.
    pub key_cache: Arc<KeyCache>,
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Name and version of this build.
async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Identity API discovery: an empty object means the v1 API is served.
async fn api_v1() -> Json<Value> {
    Json(json!({}))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    const V1: &str = "/_matrix/identity/api/v1";

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route(V1, get(api_v1))
        .route(&format!("{V1}/lookup"), get(api_lookup::lookup_handler))
        .route(
            &format!("{V1}/bulk_lookup"),
            post(api_lookup::bulk_lookup_handler),
        )
        .route(
            &format!("{V1}/validate/email/requestToken"),
            post(api_validation::request_email_token_handler),
        )
        .route(
            &format!("{V1}/validate/email/submitToken"),
            get(api_validation::submit_token_page_handler)
                .post(api_validation::submit_token_handler),
        )
        .route(
            &format!("{V1}/3pid/getValidated3pid"),
            get(api_validation::get_validated_3pid_handler),
        )
        .route(&format!("{V1}/bind"), post(api_bind::bind_handler))
        .route(&format!("{V1}/unbind"), post(api_bind::unbind_handler))
        .route(
            &format!("{V1}/store-invite"),
            post(api_invite::store_invite_handler),
        )
        .route(
            &format!("{V1}/sign-ed25519"),
            post(api_invite::sign_ed25519_handler),
        )
        .route(
            &format!("{V1}/pubkey/isvalid"),
            get(api_pubkey::is_valid_handler),
        )
        .route(
            &format!("{V1}/pubkey/ephemeral/isvalid"),
            get(api_pubkey::ephemeral_is_valid_handler),
        )
        .route(
            &format!("{V1}/pubkey/{{keyId}}"),
            get(api_pubkey::get_pubkey_handler),
        )
        .route(
            tessera_replication::PUSH_PATH,
            post(api_replication::push_handler),
        )
        .layer(axum::middleware::from_fn(middleware::log_errors_middleware))
        .layer(axum::middleware::from_fn(middleware::peer_identity_middleware))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
