//! `.well-known/matrix/server` delegation lookups.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Fetches a host's delegation document.
#[async_trait]
pub trait WellKnownFetch: Send + Sync {
    /// Returns the `m.server` value, or `None` when the host does not
    /// delegate (missing document, non-200, or malformed body).
    async fn fetch(&self, host: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct WellKnownBody {
    #[serde(rename = "m.server")]
    server: Option<String>,
}

/// [`WellKnownFetch`] over plain HTTPS.
pub struct ReqwestWellKnown {
    client: reqwest::Client,
}

impl ReqwestWellKnown {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WellKnownFetch for ReqwestWellKnown {
    async fn fetch(&self, host: &str) -> Option<String> {
        let url = format!("https://{host}/.well-known/matrix/server");
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status() == reqwest::StatusCode::OK => r,
            Ok(r) => {
                debug!(host, status = %r.status(), "no well-known delegation");
                return None;
            }
            Err(e) => {
                debug!(host, error = %e, "well-known fetch failed");
                return None;
            }
        };

        match response.json::<WellKnownBody>().await {
            Ok(body) => body.server.filter(|s| !s.is_empty()),
            Err(e) => {
                debug!(host, error = %e, "malformed well-known document");
                None
            }
        }
    }
}
