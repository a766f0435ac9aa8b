//! Connection pool construction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Connection tunables taken from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Upper bound on pooled connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Shared SQLite pool handed to every request handler.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors raised while building the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens (or creates) the database at `db_path` and returns a pool whose
/// connections run in WAL mode with foreign keys enforced.
///
/// Every pooled connection to `:memory:` is a separate database, so tests
/// that share state across connections should use a file in a temp dir.
///
/// # Errors
///
/// Returns [`PoolError::PoolInit`] if the first connection cannot be opened
/// or fails its pragma setup.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, settings.busy_timeout_ms));

    Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)
        .map_err(PoolError::from)
}

/// Per-connection pragmas. In-memory databases cannot use WAL and report
/// `memory` instead.
fn prepare_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode WAL rejected, got {mode}")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pool_applies_pragmas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tessera.db");
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 1_234,
            pool_max_size: 2,
        };

        let pool = create_pool(path.to_str().expect("utf8 path"), settings).expect("pool");
        let conn = pool.get().expect("connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("foreign_keys");
        assert_eq!(fk, 1);

        let busy: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(busy, 1_234);
        assert_eq!(pool.max_size(), 2);
    }
}
