//! Replication peers and their published keys.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tessera_types::Peer;

use crate::StoreError;

const PEER_COLUMNS: &str = "name, port, last_sent_version, last_poke_succeeded_at, active";

fn peer_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        name: row.get(0)?,
        port: row.get(1)?,
        last_sent_version: row.get(2)?,
        last_poke_succeeded_at: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        public_keys: BTreeMap::new(),
    })
}

fn load_keys(conn: &Connection, peer: &mut Peer) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT alg, key FROM peer_pubkeys WHERE peername = ?1")?;
    let rows = stmt.query_map([&peer.name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (alg, key) = row?;
        peer.public_keys.insert(alg, key);
    }
    Ok(())
}

/// Registers a peer, or refreshes its port and keys. The replication
/// cursor of an existing peer is left alone.
pub fn upsert_peer(
    conn: &mut Connection,
    name: &str,
    port: Option<u16>,
    public_keys: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    let sp = conn.savepoint()?;
    sp.execute(
        "INSERT INTO peers (name, port, active) VALUES (?1, ?2, 1)
         ON CONFLICT (name) DO UPDATE SET port = excluded.port, active = 1",
        params![name, port],
    )?;
    sp.execute("DELETE FROM peer_pubkeys WHERE peername = ?1", [name])?;
    for (alg, key) in public_keys {
        sp.execute(
            "INSERT INTO peer_pubkeys (peername, alg, key) VALUES (?1, ?2, ?3)",
            params![name, alg, key],
        )?;
    }
    sp.commit()?;
    Ok(())
}

/// Looks up an active peer by name, with its keys.
pub fn get_peer_by_name(conn: &Connection, name: &str) -> Result<Option<Peer>, StoreError> {
    let peer = conn
        .query_row(
            &format!("SELECT {PEER_COLUMNS} FROM peers WHERE name = ?1 AND active = 1"),
            [name],
            peer_row,
        )
        .optional()?;
    match peer {
        Some(mut peer) => {
            load_keys(conn, &mut peer)?;
            Ok(Some(peer))
        }
        None => Ok(None),
    }
}

/// Every active peer, with keys, ordered by name.
pub fn active_peers(conn: &Connection) -> Result<Vec<Peer>, StoreError> {
    let mut peers = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {PEER_COLUMNS} FROM peers WHERE active = 1 ORDER BY name"
        ))?;
        let rows = stmt.query_map([], peer_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for peer in &mut peers {
        load_keys(conn, peer)?;
    }
    Ok(peers)
}

/// Advances the push cursor for `name` after a successful delivery.
pub fn set_last_sent_version(
    conn: &Connection,
    name: &str,
    version: i64,
    poke_ts: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE peers SET last_sent_version = ?2, last_poke_succeeded_at = ?3 WHERE name = ?1",
        params![name, version, poke_ts],
    )?;
    Ok(())
}
