//! Storage plumbing for the Tessera identity service.
//!
//! Builds the SQLite connection pool (via `r2d2`) and applies the embedded
//! schema migrations. Query logic lives with the crates that own each table;
//! this crate only guarantees that the tables exist and that connections are
//! configured consistently.
//!
//! # Design decisions
//!
//! - **SQLite in WAL mode**: readers (lookups) never block the single
//!   writer (binds, replication batches).
//! - **Tracked migrations**: each SQL file is compiled in with `include_str!`
//!   and recorded in `_tessera_migrations`, so start-up is idempotent.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
