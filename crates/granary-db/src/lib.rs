//! # granary-db
//!
//! The coordinator's metadata store. One SQLite database holds every entity
//! family the core owns: peers, files, chunks, chunk assignments, staging
//! ciphertext, proof challenges, earnings, and heartbeat counters.
//!
//! - WAL mode, foreign keys enforced
//! - All timestamps are Unix epoch seconds (`u64`)
//! - Schema version stored in `PRAGMA user_version`; migrations are
//!   forward-only
//!
//! The store is the only shared mutable state between coordinator
//! components: the repairer sees the distributor's work through assignment
//! rows, never through in-process channels alone.

pub mod migrations;
pub mod queries;
pub mod schema;

#[cfg(test)]
pub(crate) mod testutil;

use rusqlite::Connection;
use std::path::Path;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness invariant fired; callers that race on placement treat
    /// this as a benign skip.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl DbError {
    /// Whether this error is the uniqueness-violation kind that concurrent
    /// placement is allowed to swallow.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Constraint(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the coordinator database at the given path.
///
/// Configures WAL mode and foreign keys, then runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&mut conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&mut conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Translate a raw SQLite error, turning unique-constraint failures into
/// [`DbError::Constraint`] so callers can distinguish a benign placement
/// race from real storage trouble.
pub(crate) fn map_insert_err(err: rusqlite::Error, what: &str) -> DbError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return DbError::Constraint(what.to_string());
        }
    }
    DbError::Sqlite(err)
}
