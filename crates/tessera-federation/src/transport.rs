//! The single-attempt HTTP layer underneath [`crate::RetryingTransport`].

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use reqwest::Method;
use thiserror::Error;
use url::Url;

use crate::resolver::ResolveError;
use crate::routing::RoutingInfo;

/// Errors from sending federation requests.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("routing failed: {0}")]
    Routing(#[from] ResolveError),
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("request cancelled")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
    #[error("invalid response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// A request addressed to a logical destination such as
/// `matrix://example.org/_matrix/key/v2/server/`.
#[derive(Debug, Clone)]
pub struct FederationRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl FederationRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// A POST with a JSON body and matching content type.
    pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            method: Method::POST,
            url,
            headers,
            body: Some(serde_json::to_vec(body)?),
        })
    }

    /// Applies `routing` for one attempt: sets `Host` unless the caller did,
    /// and points the request at the routed target.
    pub fn prepare(&self, routing: &RoutingInfo) -> PreparedRequest {
        let mut headers = self.headers.clone();
        if !headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&routing.host_header) {
                headers.insert(HOST, value);
            }
        }
        let mut path_and_query = self.url.path().to_string();
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }
        if let Some(query) = self.url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        PreparedRequest {
            method: self.method.clone(),
            target_host: routing.target_host.clone(),
            target_port: routing.target_port,
            tls_server_name: routing.tls_server_name.clone(),
            path_and_query,
            headers,
            body: self.body.clone(),
        }
    }
}

/// A request bound to a concrete network target for one attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub target_host: String,
    pub target_port: u16,
    pub tls_server_name: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl PreparedRequest {
    /// `https://target:port/path?query`.
    pub fn target_url(&self) -> String {
        format!(
            "https://{}:{}{}",
            bracket_ipv6(&self.target_host),
            self.target_port,
            self.path_and_query
        )
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct FederationResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FederationResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends one prepared request. Implementations read the whole body so the
/// connection can be reused.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: PreparedRequest) -> Result<FederationResponse, TransportError>;
}

/// [`HttpTransport`] over `reqwest` with rustls.
///
/// When the routed target differs from the TLS name, the request is sent to
/// the TLS name with DNS for that name pinned to the target's addresses, so
/// the certificate is checked against the logical server.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Result<Self, TransportError> {
        let user_agent = user_agent.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.clone())
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            client,
            timeout,
            user_agent,
        })
    }

    async fn pinned_client(
        &self,
        request: &PreparedRequest,
    ) -> Result<reqwest::Client, TransportError> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((request.target_host.as_str(), request.target_port))
                .await
                .map_err(|e| TransportError::Http(format!("resolving target: {e}")))?
                .collect();
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .resolve_to_addrs(&request.tls_server_name, &addrs)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<FederationResponse, TransportError> {
        let (client, url) = if request.target_host == request.tls_server_name {
            (self.client.clone(), request.target_url())
        } else {
            let pinned = self.pinned_client(&request).await?;
            let url = format!(
                "https://{}:{}{}",
                bracket_ipv6(&request.tls_server_name),
                request.target_port,
                request.path_and_query
            );
            (pinned, url)
        };

        let mut builder = client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(FederationResponse {
            status,
            body: body.to_vec(),
        })
    }
}
