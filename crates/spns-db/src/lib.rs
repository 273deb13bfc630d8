//! # spns-db
//!
//! Storage layer for the push notification server: a single SQLite database
//! holding the subscription table, its namespace relation, and the service
//! statistics counters.
//!
//! ## Schema
//!
//! - WAL mode, foreign keys enforced
//! - Schema version in `PRAGMA user_version`
//! - One subscription row per `(account, service, svcid)`; namespaces are a
//!   separate many-to-one relation with cascade delete
//!
//! Connections are handed out by the bounded idle [`pool`].

pub mod migrations;
pub mod pool;
pub mod queries;
pub mod schema;

use rusqlite::Connection;

pub use pool::{Pool, PooledConn};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Configure per-connection pragmas.
pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}
