//! Outbound replication.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};
use tessera_db::DbPool;
use tessera_federation::{FederationRequest, RetryingTransport};
use tessera_signing::ServerKey;
use tessera_store::{associations, peers};
use tessera_types::{now_ms, Peer, DEFAULT_REPLICATION_PORT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::payload::{ReplicatedAssociation, ReplicationPayload, PUSH_PATH};
use crate::sign::sign_association;
use crate::{ReplicationError, PUSH_BATCH_SIZE};

/// Copies our own local associations into the global table.
///
/// Runs [`publish_local`] in an immediate transaction. Returns the number
/// of entries applied.
pub fn push_local(
    conn: &mut Connection,
    key: &ServerKey,
    server_name: &str,
) -> Result<usize, ReplicationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let applied = publish_local(&tx, key, server_name)?;
    tx.commit()?;
    Ok(applied)
}

/// Applies local associations written since the last local push to the
/// global table, on the caller's transaction.
///
/// Entries are signed and appended under `server_name`; removals delete the
/// matching global rows instead. The local push cursor then moves past
/// every entry, so each removal is applied exactly once. Databases that
/// predate the cursor start from our highest own global origin id.
pub fn publish_local(
    conn: &Connection,
    key: &ServerKey,
    server_name: &str,
) -> Result<usize, ReplicationError> {
    let cursor = match associations::local_push_cursor(conn)? {
        Some(cursor) => cursor,
        None => associations::cursor_for(conn, server_name)?.unwrap_or(0),
    };
    let pending = associations::replay_after(conn, cursor, None)?;
    let Some(last_id) = pending.last().map(|a| a.id) else {
        return Ok(0);
    };

    for assoc in &pending {
        if assoc.is_removal() {
            associations::global_remove(conn, assoc.medium, &assoc.address)?;
        } else {
            let signed = sign_association(key, server_name, assoc)?;
            associations::global_append(conn, assoc, server_name, assoc.id, &signed)?;
        }
    }
    associations::set_local_push_cursor(conn, last_id)?;

    debug!(count = pending.len(), last_id, "applied local associations to global table");
    Ok(pending.len())
}

/// Push endpoint for `peer`.
///
/// With a configured base URL its host, port, and path prefix are used;
/// otherwise the peer name on its replication port (default 1001). The
/// result always carries an explicit port so routing never falls back to
/// discovery.
pub fn push_url(peer: &Peer, base_url: Option<&str>) -> Result<Url, ReplicationError> {
    let invalid = |reason: String| ReplicationError::InvalidPeerUrl {
        peer: peer.name.clone(),
        reason,
    };

    let (host, port, prefix) = match base_url {
        Some(base) => {
            let base = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
            let host = base
                .host_str()
                .ok_or_else(|| invalid("no host".to_string()))?
                .to_string();
            let port = base.port_or_known_default().unwrap_or(DEFAULT_REPLICATION_PORT);
            (host, port, base.path().trim_end_matches('/').to_string())
        }
        None => (
            peer.name.clone(),
            peer.port.unwrap_or(DEFAULT_REPLICATION_PORT),
            String::new(),
        ),
    };

    Url::parse(&format!("matrix://{host}:{port}{prefix}{PUSH_PATH}"))
        .map_err(|e| invalid(e.to_string()))
}

/// Pushes local associations to every active peer.
pub struct Pusher {
    pool: DbPool,
    key: ServerKey,
    server_name: String,
    transport: Arc<RetryingTransport>,
    base_urls: HashMap<String, String>,
}

impl Pusher {
    pub fn new(
        pool: DbPool,
        key: ServerKey,
        server_name: impl Into<String>,
        transport: Arc<RetryingTransport>,
    ) -> Self {
        Self {
            pool,
            key,
            server_name: server_name.into(),
            transport,
            base_urls: HashMap::new(),
        }
    }

    /// Overrides the push endpoint base for a named peer.
    pub fn with_base_url(mut self, peer: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(peer.into(), base_url.into());
        self
    }

    /// Sends the next batch pending for `peer` and advances its cursor.
    ///
    /// Returns how many associations were delivered; zero when the peer is
    /// up to date.
    pub async fn push_pending(
        &self,
        peer: &Peer,
        cancel: &CancellationToken,
    ) -> Result<usize, ReplicationError> {
        let pool = self.pool.clone();
        let after = peer.last_sent_version.unwrap_or(0);
        let pending = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            associations::replay_after(&conn, after, Some(PUSH_BATCH_SIZE))
                .map_err(ReplicationError::from)
        })
        .await??;

        let Some(last_id) = pending.last().map(|a| a.id) else {
            return Ok(0);
        };

        let mut sg_assocs = Vec::with_capacity(pending.len());
        for assoc in &pending {
            sg_assocs.push(ReplicatedAssociation {
                origin_id: assoc.id,
                signed_association: sign_association(&self.key, &self.server_name, assoc)?,
            });
        }
        let payload = serde_json::to_value(ReplicationPayload { sg_assocs })?;

        let url = push_url(peer, self.base_urls.get(&peer.name).map(String::as_str))?;
        let request = FederationRequest::post_json(url, &payload)?;
        self.transport.send(&request, cancel).await?;

        let pool = self.pool.clone();
        let name = peer.name.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            peers::set_last_sent_version(&conn, &name, last_id, now_ms())
                .map_err(ReplicationError::from)
        })
        .await??;

        info!(peer = %peer.name, count = pending.len(), last_id, "pushed associations");
        Ok(pending.len())
    }

    /// One push round over all active peers. Failures are logged per peer
    /// and do not stop the round.
    pub async fn push_all(&self, cancel: &CancellationToken) -> Result<(), ReplicationError> {
        let pool = self.pool.clone();
        let active = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            peers::active_peers(&conn).map_err(ReplicationError::from)
        })
        .await??;

        for peer in &active {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.push_pending(peer, cancel).await {
                warn!(peer = %peer.name, error = %e, "replication push failed");
            }
        }
        Ok(())
    }
}
