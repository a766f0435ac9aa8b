#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::{json, Value};
use tempfile::TempDir;
use tessera_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use tessera_federation::{KeyCache, KeyFetchError, KeyFetcher, PublishedKey, ServerKeys};
use tessera_mail::{MailError, Mailer, Templates};
use tessera_server::{app, AppState};
use tessera_signing::ServerKey;
use tessera_store::sessions;
use tower::ServiceExt;

pub const SERVER_NAME: &str = "id.example";
pub const CLIENT_BASE: &str = "https://id.example";

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Vec<String>,
    pub message: String,
}

/// Keeps every message instead of delivering it.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<SentMail>>,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> SentMail {
        self.sent.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _from: &str, to: &[String], message: &[u8]) -> Result<(), MailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::SendFailed("relay refused".into()));
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_vec(),
            message: String::from_utf8_lossy(message).into_owned(),
        });
        Ok(())
    }

    fn hostname(&self) -> &str {
        SERVER_NAME
    }
}

/// Publishes fixed keys for a set of homeservers; any other server fails.
struct StaticKeys(HashMap<String, ServerKey>);

#[async_trait]
impl KeyFetcher for StaticKeys {
    async fn fetch(&self, server: &str) -> Result<ServerKeys, KeyFetchError> {
        let key = self
            .0
            .get(server)
            .ok_or_else(|| KeyFetchError::InvalidServer(server.to_string()))?;
        Ok(ServerKeys {
            server_name: server.to_string(),
            verify_keys: HashMap::from([(
                key.key_id(),
                PublishedKey {
                    key: key.public_key_base64(),
                },
            )]),
            old_verify_keys: HashMap::new(),
            valid_until_ts: i64::MAX,
        })
    }
}

pub struct Harness {
    pub app: Router,
    pub pool: DbPool,
    pub key: ServerKey,
    pub mailer: Arc<RecordingMailer>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_homeservers(&[])
    }

    /// A server whose key cache knows the given homeserver keys.
    pub fn with_homeservers(homeservers: &[(&str, &ServerKey)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();

        let key = ServerKey::generate("0");
        let mailer = Arc::new(RecordingMailer::default());
        let fetcher = StaticKeys(
            homeservers
                .iter()
                .map(|(name, key)| (name.to_string(), (*key).clone()))
                .collect(),
        );

        let state = AppState {
            pool: pool.clone(),
            server_key: key.clone(),
            server_name: SERVER_NAME.to_string(),
            client_http_base: CLIENT_BASE.to_string(),
            peer_cert_header: "X-Client-Cert-CN".to_string(),
            email_from: "Tessera <noreply@id.example>".to_string(),
            mailer: mailer.clone(),
            templates: Arc::new(Templates::default()),
            key_cache: Arc::new(KeyCache::new(Arc::new(fetcher))),
        };

        Self {
            app: app(state),
            pool,
            key,
            mailer,
            _dir: dir,
        }
    }

    pub fn conn(&self) -> PooledConnection<SqliteConnectionManager> {
        self.pool.get().unwrap()
    }

    pub async fn send_raw(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.send_raw(request).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Runs `requestToken` and returns the new session id.
    pub async fn request_token(&self, email: &str, secret: &str, attempt: i64) -> i64 {
        let (status, body) = self
            .post_json(
                "/_matrix/identity/api/v1/validate/email/requestToken",
                &json!({"email": email, "client_secret": secret, "send_attempt": attempt}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["sid"].as_str().unwrap().parse().unwrap()
    }

    /// The token of session `sid`, as it would arrive by mail.
    pub fn token_for(&self, sid: i64) -> String {
        sessions::get_session(&self.conn(), sid)
            .unwrap()
            .unwrap()
            .token
    }

    /// Creates and validates an email session; returns `(sid, secret)`.
    pub async fn validated_session(&self, email: &str) -> (i64, String) {
        let secret = format!("secret-{email}");
        let sid = self.request_token(email, &secret, 1).await;
        let token = self.token_for(sid);
        let (status, body) = self
            .post_json(
                "/_matrix/identity/api/v1/validate/email/submitToken",
                &json!({"sid": sid.to_string(), "client_secret": secret, "token": token}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        (sid, secret)
    }

    /// Validates `email` and binds it to `mxid`; returns the bind response.
    pub async fn bind(&self, email: &str, mxid: &str) -> Value {
        let (sid, secret) = self.validated_session(email).await;
        let (status, body) = self
            .post_json(
                "/_matrix/identity/api/v1/bind",
                &json!({"sid": sid.to_string(), "client_secret": secret, "mxid": mxid}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }
}
