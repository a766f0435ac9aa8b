//! `_matrix._tcp` service discovery.

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use tracing::{debug, warn};

use crate::resolver::ResolveError;

/// One SRV answer: where to open the TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrvCandidate {
    pub target: String,
    pub port: u16,
}

/// Performs the raw SRV query for a host.
#[async_trait]
pub trait SrvLookup: Send + Sync {
    /// Returns every candidate published under `_matrix._tcp.<host>`.
    async fn lookup(&self, host: &str) -> Result<Vec<SrvCandidate>, ResolveError>;
}

/// [`SrvLookup`] backed by the system DNS configuration.
pub struct HickorySrvLookup {
    resolver: Resolver<TokioConnectionProvider>,
}

impl HickorySrvLookup {
    /// Builds a resolver from `/etc/resolv.conf`, or public defaults when
    /// the system configuration cannot be read.
    pub fn from_system() -> Self {
        let resolver = match Resolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!(error = %e, "system resolver config unavailable, using defaults");
                Resolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        Self { resolver }
    }
}

#[async_trait]
impl SrvLookup for HickorySrvLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
        let name = format!("_matrix._tcp.{host}");
        let answer = self
            .resolver
            .srv_lookup(name.as_str())
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let candidates: Vec<SrvCandidate> = answer
            .iter()
            .map(|srv| SrvCandidate {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect();
        debug!(%name, count = candidates.len(), "srv lookup");
        Ok(candidates)
    }
}
