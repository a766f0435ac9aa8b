//! Inbound replication: verify a whole batch, then apply it atomically.

use rusqlite::{Connection, TransactionBehavior};
use tessera_signing::{SignedJson, VerifyKey};
use tessera_store::associations;
use tessera_types::{Association, Peer};
use tracing::{info, warn};

use crate::payload::ReplicationPayload;
use crate::ReplicationError;

/// Finds a key of `peer` able to check its signature on `signed`.
///
/// Peers publish keys per algorithm; the key version is taken from whatever
/// `alg:version` ID the peer signed under.
fn peer_key_for(peer: &Peer, signed: &SignedJson) -> Option<VerifyKey> {
    let by_key = signed.get("signatures")?.get(&peer.name)?.as_object()?;
    by_key.keys().find_map(|key_id| {
        let (alg, _) = key_id.split_once(':')?;
        let public_key = peer.public_keys.get(alg)?;
        VerifyKey::from_base64(key_id.clone(), public_key).ok()
    })
}

/// Checks every entry's signature against `peer`'s keys.
///
/// # Errors
///
/// [`ReplicationError::VerificationFailed`] listing every origin ID that
/// did not verify.
pub fn verify_batch(peer: &Peer, payload: &ReplicationPayload) -> Result<(), ReplicationError> {
    let failed: Vec<i64> = payload
        .sg_assocs
        .iter()
        .filter(|entry| {
            let signed = &entry.signed_association;
            match peer_key_for(peer, signed) {
                Some(key) => key.verify(signed, &peer.name).is_err(),
                None => true,
            }
        })
        .map(|entry| entry.origin_id)
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        warn!(peer = %peer.name, ?failed, "rejecting replication batch");
        Err(ReplicationError::VerificationFailed { failed })
    }
}

/// Applies a verified batch from `origin_server` in one transaction.
///
/// Entries with an `mxid` are appended to the global table; entries without
/// one remove the matching global rows. Any failure rolls back the batch.
pub fn apply_batch(
    conn: &mut Connection,
    origin_server: &str,
    payload: &ReplicationPayload,
) -> Result<usize, ReplicationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut appended = 0;
    for entry in &payload.sg_assocs {
        let assoc = Association::from_json_map(&entry.signed_association)?;
        if assoc.is_removal() {
            associations::global_remove(&tx, assoc.medium, &assoc.address)?;
        } else if associations::global_append(
            &tx,
            &assoc,
            origin_server,
            entry.origin_id,
            &entry.signed_association,
        )? {
            appended += 1;
        }
    }
    tx.commit()?;
    Ok(appended)
}

/// Verifies and applies a push from `peer`. Nothing is written unless every
/// signature checks out.
pub fn receive(
    conn: &mut Connection,
    peer: &Peer,
    payload: &ReplicationPayload,
) -> Result<usize, ReplicationError> {
    verify_batch(peer, payload)?;
    let appended = apply_batch(conn, &peer.name, payload)?;
    info!(
        peer = %peer.name,
        received = payload.sg_assocs.len(),
        appended,
        "applied replication batch"
    );
    Ok(appended)
}
