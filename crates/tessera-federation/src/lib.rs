//! Federation plumbing for the Tessera identity service.
//!
//! Outbound traffic to homeservers and peer identity servers goes through a
//! [`RetryingTransport`]. Each attempt re-runs [`route`], which turns a
//! destination such as `matrix://example.org/_matrix/key/v2/server/` into a
//! concrete `host:port` plus the Host header and TLS name to present.
//! Routing falls back from literal addresses and explicit ports to
//! `.well-known` delegation and finally `_matrix._tcp` SRV records, all
//! cached by [`FederationResolver`].
//!
//! Inbound, [`xmatrix`] parses `Authorization: X-Matrix ...` headers and
//! [`KeyCache`] supplies the origin server's published keys to check them.

pub mod keys;
pub mod resolver;
pub mod retry;
pub mod routing;
pub mod srv;
pub mod transport;
pub mod well_known;
pub mod xmatrix;

pub use keys::{
    FederationKeyFetcher, KeyCache, KeyFetchError, KeyFetcher, OldPublishedKey, PublishedKey,
    ServerKeys,
};
pub use resolver::{pick, FederationResolver, ResolveError};
pub use retry::{Backoff, RetryingTransport};
pub use routing::{route, RoutingInfo};
pub use srv::{HickorySrvLookup, SrvCandidate, SrvLookup};
pub use transport::{
    FederationRequest, FederationResponse, HttpTransport, PreparedRequest, ReqwestTransport,
    TransportError,
};
pub use well_known::{ReqwestWellKnown, WellKnownFetch};
pub use xmatrix::{authorization_header, XMatrixAuth, XMatrixError};
