//! Persistence for associations, validation sessions, invites, and peers.
//!
//! Every function takes a `rusqlite` connection (or transaction) so callers
//! choose the transactional scope. The replication receiver, for instance,
//! opens one transaction and applies a whole batch through
//! [`associations::global_append`] and [`associations::global_remove`].

pub mod associations;
pub mod invites;
pub mod peers;
pub mod sessions;

use thiserror::Error;

pub use associations::GlobalRecord;
pub use sessions::{SessionError, TokenRequest};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A row held a value the domain types cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Reads a `medium` column into the domain enum.
pub(crate) fn medium_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<tessera_types::Medium> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: tessera_types::UnknownMedium| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}
