//! # granary-coordinator
//!
//! The coordinator daemon: chunk placement, distribution, replication
//! repair, proof scheduling, economics, and the peer registry.
//!
//! Components share exactly one piece of mutable state — the metadata store
//! — and observe each other through its rows: the repairer sees the
//! distributor's work as assignment states, the economics evaluator sees
//! the proof scheduler's work as challenge outcomes. Each background loop
//! owns a shutdown receiver and exits at its next iteration boundary.

pub mod config;
pub mod distributor;
pub mod economics;
pub mod fetch;
pub mod files;
pub mod http;
pub mod placement;
pub mod registry;
pub mod repairer;
pub mod scheduler;

use std::sync::Arc;

use uuid::Uuid;

/// Shared handle to the coordinator metadata store.
///
/// rusqlite connections are not `Sync`; every component locks for the
/// duration of one query or transaction, which keeps row transitions
/// serialized without a second locking discipline.
pub type Db = Arc<tokio::sync::Mutex<rusqlite::Connection>>;

/// Error types for coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error(transparent)]
    Db(#[from] granary_db::DbError),

    #[error(transparent)]
    Transport(#[from] granary_transport::TransportError),

    /// Fewer peers can accept the chunk than the replica target requires.
    #[error("insufficient capacity: needed {needed} eligible peers, found {eligible}")]
    InsufficientCapacity { needed: usize, eligible: usize },

    /// Bytes fetched for a chunk did not hash to its recorded
    /// `ciphertext_hash`. Fatal for that transfer; never retried.
    #[error("hash mismatch for chunk {chunk_id}: expected {expected}, computed {computed}")]
    HashMismatch {
        chunk_id: Uuid,
        expected: String,
        computed: String,
    },

    /// No replica nor staging copy could produce the chunk's ciphertext.
    #[error("no source for chunk {0}")]
    NoSource(Uuid),

    /// Every transfer of a distribute call failed; the caller decides
    /// whether the upload itself fails.
    #[error("no replicas stored for chunk {0}")]
    NoReplicasStored(Uuid),

    /// A chunk exceeded the configured ciphertext bound.
    #[error("chunk of {size} bytes exceeds maximum {max}")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
pub(crate) fn test_db() -> Db {
    Arc::new(tokio::sync::Mutex::new(
        granary_db::open_memory().expect("open test db"),
    ))
}
