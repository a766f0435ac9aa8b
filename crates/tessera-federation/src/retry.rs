//! Routing-aware retries with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::resolver::FederationResolver;
use crate::routing::route;
use crate::transport::{FederationRequest, FederationResponse, HttpTransport, TransportError};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_retries: 16,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Sleep before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        // Saturates to infinity (or NaN for a NaN multiplier) long before u32::MAX.
        Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * factor)
            .map_or(self.max_interval, |d| d.min(self.max_interval))
    }
}

/// Sends federation requests, re-routing and retrying until a 200 arrives.
///
/// Every non-200 status is treated as a failure, including ones that carry
/// meaning such as 404; callers only ever see a 200 or an error.
pub struct RetryingTransport {
    resolver: Arc<FederationResolver>,
    inner: Arc<dyn HttpTransport>,
    backoff: Backoff,
    allow_well_known: bool,
}

impl RetryingTransport {
    pub fn new(
        resolver: Arc<FederationResolver>,
        inner: Arc<dyn HttpTransport>,
        backoff: Backoff,
    ) -> Self {
        Self {
            resolver,
            inner,
            backoff,
            allow_well_known: false,
        }
    }

    /// Lets routing consult `.well-known` delegation.
    pub fn with_well_known(mut self, allow: bool) -> Self {
        self.allow_well_known = allow;
        self
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Sends `request`, retrying per the backoff policy.
    ///
    /// `cancel` is checked before every sleep; a cancelled token ends the
    /// loop with [`TransportError::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`TransportError::RetriesExhausted`] wrapping the last failure once
    /// `max_retries + 1` attempts have failed.
    pub async fn send(
        &self,
        request: &FederationRequest,
        cancel: &CancellationToken,
    ) -> Result<FederationResponse, TransportError> {
        let attempts = self.backoff.max_retries + 1;
        let mut last = TransportError::Cancelled;

        for attempt in 0..attempts {
            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(url = %request.url, attempt, error = %e, "federation attempt failed");
                    last = e;
                }
            }

            if attempt + 1 == attempts {
                break;
            }
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.backoff.delay(attempt)) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }

        warn!(url = %request.url, attempts, error = %last, "federation request gave up");
        Err(TransportError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    async fn attempt(&self, request: &FederationRequest) -> Result<FederationResponse, TransportError> {
        let routing = route(&self.resolver, &request.url, self.allow_well_known).await?;
        let response = self.inner.send(request.prepare(&routing)).await?;
        if response.status != 200 {
            return Err(TransportError::Status(response.status));
        }
        Ok(response)
    }

    /// GETs `url` and decodes the JSON body.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        self.send(&FederationRequest::get(url), cancel).await?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolveError;
    use crate::srv::{SrvCandidate, SrvLookup};
    use crate::transport::PreparedRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct OneTarget;

    #[async_trait]
    impl SrvLookup for OneTarget {
        async fn lookup(&self, _host: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
            Ok(vec![SrvCandidate {
                target: "fed.example.net".to_string(),
                port: 8448,
            }])
        }
    }

    /// Fails with 503 for the first `failures` calls, then answers 200.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<PreparedRequest>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for Flaky {
        async fn send(&self, request: PreparedRequest) -> Result<FederationResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            let status = if n < self.failures { 503 } else { 200 };
            Ok(FederationResponse {
                status,
                body: b"{}".to_vec(),
            })
        }
    }

    fn transport(inner: Arc<Flaky>, max_retries: u32) -> RetryingTransport {
        RetryingTransport::new(
            Arc::new(FederationResolver::new(Arc::new(OneTarget))),
            inner,
            Backoff {
                initial_interval: Duration::from_millis(1),
                multiplier: 2.0,
                max_retries,
                max_interval: Duration::from_secs(1),
            },
        )
    }

    fn request() -> FederationRequest {
        FederationRequest::get(Url::parse("matrix://example.org/_matrix/key/v2/server/").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_plus_one_calls() {
        let fake = Flaky::new(3);
        let t = transport(fake.clone(), 5);

        let response = t.send(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 4);

        let seen = fake.seen.lock().unwrap();
        assert!(seen.iter().all(|r| r.target_host == "fed.example.net"));
        assert!(seen.iter().all(|r| r.headers["host"] == "example.org"));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_makes_max_plus_one_attempts() {
        let fake = Flaky::new(u32::MAX);
        let t = transport(fake.clone(), 4);

        let err = t.send(&request(), &CancellationToken::new()).await.unwrap_err();
        match err {
            TransportError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, TransportError::Status(503)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_sleep() {
        let fake = Flaky::new(u32::MAX);
        let t = transport(fake.clone(), 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = t.send(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_geometrically() {
        let b = Backoff {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_retries: 3,
            max_interval: Duration::from_secs(60),
        };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped_for_large_retry_counts() {
        let b = Backoff {
            initial_interval: Duration::from_millis(200),
            multiplier: 2.0,
            max_retries: u32::MAX,
            max_interval: Duration::from_secs(60),
        };
        assert_eq!(b.delay(8), Duration::from_millis(51_200));
        assert_eq!(b.delay(9), Duration::from_secs(60));
        assert_eq!(b.delay(150), Duration::from_secs(60));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(60));

        let nan = Backoff {
            multiplier: f64::NAN,
            ..b
        };
        assert_eq!(nan.delay(3), Duration::from_secs(60));
    }
}
