//! Local and global association tables.
//!
//! The local table holds bindings made on this server, one row per
//! `(medium, address)`. Its autoincrement `id` is the origin sequence that
//! replication pushes from: every write replaces the row, so each bind or
//! unbind gets a fresh, higher id.
//!
//! The global table is an append-only log of signed associations from every
//! origin (this server included), keyed by `(origin_server, origin_id)`.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tessera_types::{Association, Medium};

use crate::{medium_column, StoreError};

/// Pairs inserted per statement during a bulk lookup.
const BULK_CHUNK: usize = 500;

/// A row of the global table.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRecord {
    pub association: Association,
    pub origin_server: String,
    pub origin_id: i64,
    /// The signed association exactly as received.
    pub signed: Map<String, Value>,
}

fn local_row(row: &Row<'_>) -> rusqlite::Result<Association> {
    let extra: String = row.get(7)?;
    let extra_fields = serde_json::from_str(&extra).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Association {
        id: row.get(0)?,
        medium: medium_column(row, 1)?,
        address: row.get(2)?,
        mxid: row.get(3)?,
        ts: row.get(4)?,
        not_before: row.get(5)?,
        not_after: row.get(6)?,
        extra_fields,
    })
}

/// Writes a local binding, replacing any row for the same `(medium, address)`.
/// Email addresses are stored in their normalized spelling.
///
/// Returns the new origin sequence number.
pub fn local_upsert(conn: &Connection, association: &Association) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO local_threepid_associations
            (medium, address, mxid, ts, not_before, not_after, extra_fields)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            association.medium.as_str(),
            association.medium.normalize_address(&association.address),
            association.mxid,
            association.ts,
            association.not_before,
            association.not_after,
            serde_json::to_string(&association.extra_fields)?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Records an unbind of `(medium, address)` from `mxid`.
///
/// Only applies when the current local row is bound to exactly `mxid`; the
/// row is then replaced by one with a null `mxid` and timestamps of `now`.
/// Returns whether anything changed.
pub fn local_remove(
    conn: &Connection,
    medium: Medium,
    address: &str,
    mxid: &str,
    now: i64,
) -> Result<bool, StoreError> {
    // Single statement so the match check and the rewrite are atomic.
    let changed = conn.execute(
        "INSERT OR REPLACE INTO local_threepid_associations
            (medium, address, mxid, ts, not_before, not_after, extra_fields)
         SELECT medium, address, NULL, ?4, ?4, ?4, '{}'
         FROM local_threepid_associations
         WHERE medium = ?1 AND address = ?2 AND mxid = ?3",
        params![medium.as_str(), medium.normalize_address(address), mxid, now],
    )?;
    Ok(changed > 0)
}

/// Local associations with an id above `after_id`, oldest first.
pub fn replay_after(
    conn: &Connection,
    after_id: i64,
    limit: Option<u32>,
) -> Result<Vec<Association>, StoreError> {
    let limit: i64 = limit.map_or(-1, i64::from);
    let mut stmt = conn.prepare(
        "SELECT id, medium, address, mxid, ts, not_before, not_after, extra_fields
         FROM local_threepid_associations
         WHERE id > ?1
         ORDER BY id ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after_id, limit], local_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Current local binding for `(medium, address)`, if any.
pub fn local_get(
    conn: &Connection,
    medium: Medium,
    address: &str,
) -> Result<Option<Association>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, medium, address, mxid, ts, not_before, not_after, extra_fields
             FROM local_threepid_associations
             WHERE medium = ?1 AND address = ?2",
            params![medium.as_str(), medium.normalize_address(address)],
            local_row,
        )
        .optional()?)
}

/// Appends a signed association from `origin_server`.
///
/// Re-delivery of an existing `(origin_server, origin_id)` is ignored.
/// Returns whether a row was inserted.
pub fn global_append(
    conn: &Connection,
    association: &Association,
    origin_server: &str,
    origin_id: i64,
    signed: &Map<String, Value>,
) -> Result<bool, StoreError> {
    let raw = serde_json::to_string(signed)?;
    let inserted = conn.execute(
        "INSERT INTO global_threepid_associations
            (medium, address, mxid, ts, not_before, not_after,
             origin_server, origin_id, sg_assoc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (origin_server, origin_id) DO NOTHING",
        params![
            association.medium.as_str(),
            association.address,
            association.mxid.as_deref().unwrap_or_default(),
            association.ts,
            association.not_before,
            association.not_after,
            origin_server,
            origin_id,
            raw,
        ],
    )?;
    Ok(inserted > 0)
}

/// Deletes every global row for `(medium, address)`. Returns the row count.
pub fn global_remove(conn: &Connection, medium: Medium, address: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM global_threepid_associations
         WHERE medium = ?1 AND lower(address) = lower(?2)",
        params![medium.as_str(), address],
    )?)
}

/// Highest local id already applied to our own global rows, or `None`
/// before the first local push.
pub fn local_push_cursor(conn: &Connection) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT last_applied_id FROM local_push_cursor WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

/// Records that local ids up to `last_applied_id` are in the global table.
pub fn set_local_push_cursor(conn: &Connection, last_applied_id: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_push_cursor (id, last_applied_id) VALUES (0, ?1)
         ON CONFLICT (id) DO UPDATE SET last_applied_id = excluded.last_applied_id",
        [last_applied_id],
    )?;
    Ok(())
}

/// Highest origin id seen from `origin_server`, or `None` before the first.
pub fn cursor_for(conn: &Connection, origin_server: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn.query_row(
        "SELECT MAX(origin_id) FROM global_threepid_associations WHERE origin_server = ?1",
        [origin_server],
        |row| row.get(0),
    )?)
}

/// The newest global association for `(medium, address)` valid at `now`.
pub fn lookup_current(
    conn: &Connection,
    medium: Medium,
    address: &str,
    now: i64,
) -> Result<Option<GlobalRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT medium, address, mxid, ts, not_before, not_after,
                    origin_server, origin_id, sg_assoc
             FROM global_threepid_associations
             WHERE medium = ?1 AND lower(address) = lower(?2)
               AND not_before <= ?3 AND not_after >= ?3
             ORDER BY ts DESC
             LIMIT 1",
            params![medium.as_str(), address, now],
            |row| {
                Ok((
                    Association {
                        id: 0,
                        medium: medium_column(row, 0)?,
                        address: row.get(1)?,
                        mxid: row.get(2)?,
                        ts: row.get(3)?,
                        not_before: row.get(4)?,
                        not_after: row.get(5)?,
                        extra_fields: Map::new(),
                    },
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((association, origin_server, origin_id, raw)) = row else {
        return Ok(None);
    };
    let signed = match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Corrupt(format!(
                "sg_assoc for {origin_server}/{origin_id} is not an object: {other}"
            )))
        }
    };
    Ok(Some(GlobalRecord {
        association,
        origin_server,
        origin_id,
        signed,
    }))
}

/// Resolves many `(medium, address)` pairs at once.
///
/// Returns `(medium, address, mxid)` for each pair with a current binding,
/// in input order, with the address as the caller spelled it. Pairs are
/// staged in a temporary table [`BULK_CHUNK`] at a time so no statement
/// carries an unbounded number of parameters.
pub fn bulk_lookup(
    conn: &Connection,
    pairs: &[(String, String)],
    now: i64,
) -> Result<Vec<(String, String, String)>, StoreError> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS tmp_bulk_lookup (medium TEXT NOT NULL, address TEXT NOT NULL);
         DELETE FROM tmp_bulk_lookup;",
    )?;

    for chunk in pairs.chunks(BULK_CHUNK) {
        let placeholders = vec!["(?, ?)"; chunk.len()].join(", ");
        let sql = format!("INSERT INTO tmp_bulk_lookup (medium, address) VALUES {placeholders}");
        let values = chunk
            .iter()
            .flat_map(|(medium, address)| [medium.as_str(), address.as_str()]);
        conn.execute(&sql, params_from_iter(values))?;
    }

    let mut found: HashMap<(String, String), String> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT t.medium, t.address, g.mxid
             FROM tmp_bulk_lookup t
             JOIN global_threepid_associations g
               ON g.medium = t.medium AND lower(g.address) = lower(t.address)
             WHERE g.not_before <= ?1 AND g.not_after >= ?1
             ORDER BY g.ts DESC",
        )?;
        let rows = stmt.query_map([now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (medium, address, mxid) = row?;
            // Newest first: keep the first hit per pair as the caller spelled it.
            found.entry((medium, address)).or_insert(mxid);
        }
    }
    conn.execute("DELETE FROM tmp_bulk_lookup", [])?;

    Ok(pairs
        .iter()
        .filter_map(|(medium, address)| {
            found
                .get(&(medium.clone(), address.clone()))
                .map(|mxid| (medium.clone(), address.clone(), mxid.clone()))
        })
        .collect())
}
