//! Remote server signing keys, fetched over federation and cached.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tessera_signing::VerifyKey;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::retry::RetryingTransport;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum KeyFetchError {
    #[error("fetching keys for {server}: {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },
    #[error("invalid server name: {0}")]
    InvalidServer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishedKey {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OldPublishedKey {
    pub key: String,
    #[serde(default)]
    pub expired_ts: i64,
}

/// Body of `GET /_matrix/key/v2/server/`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerKeys {
    pub server_name: String,
    #[serde(default)]
    pub verify_keys: HashMap<String, PublishedKey>,
    #[serde(default)]
    pub old_verify_keys: HashMap<String, OldPublishedKey>,
    #[serde(default)]
    pub valid_until_ts: i64,
}

impl ServerKeys {
    /// The current key published under `key_id`, if any and well formed.
    pub fn verify_key(&self, key_id: &str) -> Option<VerifyKey> {
        let published = self.verify_keys.get(key_id)?;
        VerifyKey::from_base64(key_id, &published.key).ok()
    }
}

/// Source of [`ServerKeys`].
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self, server: &str) -> Result<ServerKeys, KeyFetchError>;
}

/// [`KeyFetcher`] that asks the server itself, unauthenticated, through the
/// retrying federation transport.
pub struct FederationKeyFetcher {
    transport: Arc<RetryingTransport>,
    shutdown: CancellationToken,
}

impl FederationKeyFetcher {
    pub fn new(transport: Arc<RetryingTransport>, shutdown: CancellationToken) -> Self {
        Self {
            transport,
            shutdown,
        }
    }
}

#[async_trait]
impl KeyFetcher for FederationKeyFetcher {
    async fn fetch(&self, server: &str) -> Result<ServerKeys, KeyFetchError> {
        let url = Url::parse(&format!("matrix://{server}/_matrix/key/v2/server/"))
            .map_err(|_| KeyFetchError::InvalidServer(server.to_string()))?;
        self.transport
            .get_json(url, &self.shutdown)
            .await
            .map_err(|source| KeyFetchError::Transport {
                server: server.to_string(),
                source,
            })
    }
}

/// Process-lifetime cache of [`ServerKeys`] keyed by origin server.
///
/// Entries never expire; a miss triggers one fetch, and concurrent misses
/// may both fetch (last write wins).
pub struct KeyCache {
    fetcher: Arc<dyn KeyFetcher>,
    entries: RwLock<HashMap<String, Arc<ServerKeys>>>,
}

impl KeyCache {
    pub fn new(fetcher: Arc<dyn KeyFetcher>) -> Self {
        Self {
            fetcher,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached keys for `server`, fetching them on a miss.
    pub async fn get(&self, server: &str) -> Result<Arc<ServerKeys>, KeyFetchError> {
        if let Some(hit) = self.entries.read().await.get(server) {
            return Ok(Arc::clone(hit));
        }

        let keys = Arc::new(self.fetcher.fetch(server).await?);
        info!(server, keys = keys.verify_keys.len(), "cached server keys");
        self.entries
            .write()
            .await
            .insert(server.to_string(), Arc::clone(&keys));
        Ok(keys)
    }
}
