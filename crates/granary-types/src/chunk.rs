//! Chunks and their placements on peers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseStatusError;

/// A fixed-size encrypted slice of a file; the unit of placement and repair.
///
/// `(file_id, chunk_index)` is unique and `ciphertext_hash` is fixed at
/// creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: u32,
    /// Lowercase hex SHA-256 of the encrypted bytes.
    pub ciphertext_hash: String,
    pub ciphertext_size_bytes: u64,
    pub last_verified_at: Option<u64>,
}

/// Lifecycle state of a `(chunk, peer)` placement edge.
///
/// A chunk's live replica count is the number of its assignments in
/// `Active`. At most one non-`Deleted` assignment exists per
/// `(chunk_id, peer_id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentState {
    /// Transfer in flight; not yet acknowledged.
    Pending,
    /// Acknowledged by the peer; counts as a replica.
    Active,
    /// Transfer or verification failed after retries.
    Failed,
    /// Peer was told to delete; terminal.
    Deleted,
    /// The holding peer went dead; bytes may exist but do not count.
    Orphaned,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Pending => "pending",
            AssignmentState::Active => "active",
            AssignmentState::Failed => "failed",
            AssignmentState::Deleted => "deleted",
            AssignmentState::Orphaned => "orphaned",
        }
    }
}

impl FromStr for AssignmentState {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssignmentState::Pending),
            "active" => Ok(AssignmentState::Active),
            "failed" => Ok(AssignmentState::Failed),
            "deleted" => Ok(AssignmentState::Deleted),
            "orphaned" => Ok(AssignmentState::Orphaned),
            other => Err(ParseStatusError {
                kind: "assignment state",
                value: other.to_string(),
            }),
        }
    }
}

/// A chunk-to-peer placement record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub assignment_id: Uuid,
    pub chunk_id: Uuid,
    pub peer_id: String,
    pub state: AssignmentState,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            AssignmentState::Pending,
            AssignmentState::Active,
            AssignmentState::Failed,
            AssignmentState::Deleted,
            AssignmentState::Orphaned,
        ] {
            let parsed: AssignmentState = state.as_str().parse().expect("parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = "lost".parse::<AssignmentState>().unwrap_err();
        assert!(err.to_string().contains("lost"));
    }
}
