//! Peer replication of signed associations.
//!
//! Outbound, the [`Pusher`] reads local associations past each peer's
//! cursor, signs them, and POSTs them to the peer's push endpoint. Inbound,
//! [`receive`] checks every signature in a batch before touching the global
//! table, then applies the whole batch in one transaction.

pub mod payload;
pub mod push;
pub mod receive;
pub mod sign;

use tessera_federation::TransportError;
use tessera_signing::SigningError;
use tessera_store::StoreError;
use thiserror::Error;

pub use payload::{ReplicatedAssociation, ReplicationPayload, PUSH_PATH};
pub use push::{publish_local, push_local, push_url, Pusher};
pub use receive::{apply_batch, receive, verify_batch};
pub use sign::{attach_invites, sign_association};

/// Number of associations sent to a peer per push.
pub const PUSH_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid replication URL for {peer}: {reason}")]
    InvalidPeerUrl { peer: String, reason: String },
    /// One or more entries failed signature verification; nothing was applied.
    #[error("signature verification failed for origin IDs {failed:?}")]
    VerificationFailed { failed: Vec<i64> },
}
