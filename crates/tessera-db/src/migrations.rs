//! Embedded schema migrations.
//!
//! Applied in list order at start-up. `_tessera_migrations` records which
//! names have run; each migration and its tracking row commit together.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end; never reorder or edit applied ones.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_associations",
        sql: include_str!("migrations/000_associations.sql"),
    },
    Migration {
        name: "001_validation_sessions",
        sql: include_str!("migrations/001_validation_sessions.sql"),
    },
    Migration {
        name: "002_invites",
        sql: include_str!("migrations/002_invites.sql"),
    },
    Migration {
        name: "003_peers",
        sql: include_str!("migrations/003_peers.sql"),
    },
    Migration {
        name: "004_push_cursor_and_session_triple",
        sql: include_str!("migrations/004_push_cursor_and_session_triple.sql"),
    },
];

/// Errors raised while migrating.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to read migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every pending migration and returns how many ran.
///
/// # Errors
///
/// Returns [`MigrationError::ExecutionFailed`] naming the migration whose SQL
/// failed (its changes are rolled back), or [`MigrationError::StateQuery`]
/// if the tracking table cannot be read.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let failed = |name: &str| {
        let name = name.to_string();
        move |source| MigrationError::ExecutionFailed { name, source }
    };

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _tessera_migrations (
            name TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(failed("_tessera_migrations"))?;

    let mut applied = 0;
    for migration in migrations {
        let done: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _tessera_migrations WHERE name = ?1)",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;
        if done {
            tracing::debug!(migration = migration.name, "already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");
        let tx = conn
            .unchecked_transaction()
            .map_err(failed(migration.name))?;
        tx.execute_batch(migration.sql)
            .map_err(failed(migration.name))?;
        tx.execute(
            "INSERT INTO _tessera_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed(migration.name))?;
        tx.commit().map_err(failed(migration.name))?;
        applied += 1;
    }

    Ok(applied)
}
