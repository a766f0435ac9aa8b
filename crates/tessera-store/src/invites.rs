//! Third-party invites and their ephemeral public keys.

use rusqlite::{params, Connection, OptionalExtension};
use tessera_types::{InviteToken, Medium};

use crate::{medium_column, StoreError};

/// Stores an invite issued for `(medium, address)`.
pub fn store_invite(conn: &Connection, invite: &InviteToken) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO invite_tokens (medium, address, room_id, sender, token, received_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            invite.medium.as_str(),
            invite.medium.normalize_address(&invite.address),
            invite.room_id,
            invite.sender,
            invite.token,
            invite.received_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Invites for `(medium, address)` that have not been delivered to a binding yet.
pub fn pending_invites(
    conn: &Connection,
    medium: Medium,
    address: &str,
) -> Result<Vec<InviteToken>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, medium, address, room_id, sender, token, received_ts, sent_ts
         FROM invite_tokens
         WHERE medium = ?1 AND address = ?2 AND sent_ts IS NULL
         ORDER BY id ASC",
    )?;
    let address = medium.normalize_address(address);
    let rows = stmt.query_map(params![medium.as_str(), address], |row| {
        Ok(InviteToken {
            id: row.get(0)?,
            medium: medium_column(row, 1)?,
            address: row.get(2)?,
            room_id: row.get(3)?,
            sender: row.get(4)?,
            token: row.get(5)?,
            received_at: row.get(6)?,
            sent_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Marks every pending invite for `(medium, address)` as delivered at `now`.
pub fn mark_invites_sent(
    conn: &Connection,
    medium: Medium,
    address: &str,
    now: i64,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE invite_tokens SET sent_ts = ?3
         WHERE medium = ?1 AND address = ?2 AND sent_ts IS NULL",
        params![medium.as_str(), medium.normalize_address(address), now],
    )?)
}

/// Drops an invite that could not be delivered, together with the
/// ephemeral key minted for it.
pub fn discard_invite(conn: &Connection, token: &str, public_key: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM invite_tokens WHERE token = ?1", [token])?;
    conn.execute(
        "DELETE FROM ephemeral_public_keys WHERE public_key = ?1",
        [public_key],
    )?;
    Ok(())
}

/// The user who sent the invite carrying `token`.
pub fn sender_for_token(conn: &Connection, token: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT sender FROM invite_tokens WHERE token = ?1",
            [token],
            |row| row.get(0),
        )
        .optional()?)
}

/// Persists a freshly minted ephemeral public key.
pub fn store_ephemeral_key(conn: &Connection, public_key: &str, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO ephemeral_public_keys (public_key, persistence_ts) VALUES (?1, ?2)",
        params![public_key, now],
    )?;
    Ok(())
}

/// Returns whether `public_key` is one we minted, counting the check.
pub fn ephemeral_key_is_valid(conn: &Connection, public_key: &str) -> Result<bool, StoreError> {
    let updated = conn.execute(
        "UPDATE ephemeral_public_keys SET verify_count = verify_count + 1 WHERE public_key = ?1",
        [public_key],
    )?;
    Ok(updated > 0)
}
