//! Cached SRV resolution and candidate selection.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::srv::{SrvCandidate, SrvLookup};
use crate::well_known::WellKnownFetch;

/// Errors raised while turning a destination into a network address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no SRV candidates for {0}")]
    NoCandidates(String),
    #[error("SRV lookup for {host} failed: {reason}")]
    Lookup { host: String, reason: String },
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
}

/// Resolves hostnames to SRV candidates, caching answers for the lifetime
/// of the process.
///
/// Concurrent misses on the same host may each perform a lookup; the last
/// writer wins. Entries are never evicted.
pub struct FederationResolver {
    lookup: Arc<dyn SrvLookup>,
    srv_cache: RwLock<HashMap<String, Vec<SrvCandidate>>>,
    well_known: Option<Arc<dyn WellKnownFetch>>,
    /// `None` values record hosts known to have no delegation.
    well_known_cache: RwLock<HashMap<String, Option<String>>>,
}

impl FederationResolver {
    pub fn new(lookup: Arc<dyn SrvLookup>) -> Self {
        Self {
            lookup,
            srv_cache: RwLock::new(HashMap::new()),
            well_known: None,
            well_known_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Enables `.well-known/matrix/server` delegation through `fetcher`.
    pub fn with_well_known(mut self, fetcher: Arc<dyn WellKnownFetch>) -> Self {
        self.well_known = Some(fetcher);
        self
    }

    /// Returns every SRV candidate for `host`.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NoCandidates`] when discovery fails or finds nothing.
    /// Failures are not cached.
    pub async fn resolve(&self, host: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
        if let Some(hit) = self.srv_cache.read().await.get(host) {
            return Ok(hit.clone());
        }

        let candidates = match self.lookup.lookup(host).await {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => return Err(ResolveError::NoCandidates(host.to_string())),
            Err(e) => {
                debug!(host, error = %e, "srv discovery failed");
                return Err(ResolveError::NoCandidates(host.to_string()));
            }
        };

        self.srv_cache
            .write()
            .await
            .insert(host.to_string(), candidates.clone());
        Ok(candidates)
    }

    /// Returns the delegated server name for `host`, if it publishes one.
    ///
    /// Always `None` when no fetcher is configured.
    pub async fn well_known(&self, host: &str) -> Option<String> {
        let fetcher = self.well_known.as_ref()?;
        if let Some(hit) = self.well_known_cache.read().await.get(host) {
            return hit.clone();
        }

        let delegated = fetcher.fetch(host).await;
        self.well_known_cache
            .write()
            .await
            .insert(host.to_string(), delegated.clone());
        delegated
    }
}

/// Chooses one candidate: the only one, or a uniformly random one.
///
/// # Errors
///
/// [`ResolveError::NoCandidates`] when `candidates` is empty.
pub fn pick(candidates: &[SrvCandidate]) -> Result<SrvCandidate, ResolveError> {
    match candidates {
        [] => Err(ResolveError::NoCandidates("empty candidate list".to_string())),
        [only] => Ok(only.clone()),
        many => {
            let i = rand::thread_rng().gen_range(0..many.len());
            Ok(many[i].clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        answers: Vec<SrvCandidate>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SrvLookup for CountingLookup {
        async fn lookup(&self, _host: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answers.clone())
        }
    }

    fn candidate(target: &str, port: u16) -> SrvCandidate {
        SrvCandidate {
            target: target.to_string(),
            port,
        }
    }

    #[test]
    fn pick_single_is_deterministic() {
        let only = vec![candidate("a.example", 8448)];
        for _ in 0..20 {
            assert_eq!(pick(&only).unwrap(), only[0]);
        }
    }

    #[test]
    fn pick_many_covers_the_set_and_nothing_else() {
        let set = vec![
            candidate("a.example", 1),
            candidate("b.example", 2),
            candidate("c.example", 3),
        ];
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let chosen = pick(&set).unwrap();
            assert!(set.contains(&chosen));
            seen.insert(chosen);
        }
        assert_eq!(seen.len(), set.len());
    }

    #[test]
    fn pick_empty_fails() {
        assert!(matches!(pick(&[]), Err(ResolveError::NoCandidates(_))));
    }

    #[tokio::test]
    async fn resolve_caches_answers() {
        let lookup = Arc::new(CountingLookup {
            answers: vec![candidate("srv.example", 443)],
            calls: AtomicUsize::new(0),
        });
        let resolver = FederationResolver::new(lookup.clone());

        for _ in 0..3 {
            let got = resolver.resolve("example.org").await.unwrap();
            assert_eq!(got, vec![candidate("srv.example", 443)]);
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_answer_is_not_cached() {
        let lookup = Arc::new(CountingLookup {
            answers: vec![],
            calls: AtomicUsize::new(0),
        });
        let resolver = FederationResolver::new(lookup.clone());

        assert!(resolver.resolve("nowhere.example").await.is_err());
        assert!(resolver.resolve("nowhere.example").await.is_err());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }
}
