//! # granary-types
//!
//! Shared domain types used across the granary workspace: the entity rows
//! the coordinator persists, the status enums that drive every state
//! machine, and the clock helpers the periodic jobs schedule against.
//!
//! All timestamps are Unix epoch seconds (`u64`); the economics day is the
//! epoch-day number (`secs / 86_400`).

pub mod chunk;
pub mod clock;
pub mod earnings;
pub mod file;
pub mod peer;
pub mod proof;

pub use chunk::{AssignmentState, Chunk, ChunkAssignment};
pub use earnings::PeerEarnings;
pub use file::{File, FileStatus};
pub use peer::{Peer, PeerStatus};
pub use proof::{ChallengeState, FailureReason, ProofChallenge};

/// Maximum ciphertext size of a single chunk (256 KiB).
pub const DEFAULT_CHUNK_MAX_BYTES: u64 = 262_144;

/// Default number of replicas a chunk is kept at.
pub const DEFAULT_REPLICAS: u32 = 3;

/// Bytes per GiB, the unit storage credits are priced in.
pub const BYTES_PER_GIB: u64 = 1_073_741_824;

/// AEAD envelope added to every encrypted chunk: 12-byte nonce + 16-byte tag.
///
/// A plaintext slice of exactly `chunk_max_bytes` therefore produces exactly
/// one chunk whose ciphertext is `chunk_max_bytes + AEAD_OVERHEAD` bytes.
pub const AEAD_OVERHEAD: u64 = 12 + 16;

/// Error raised when a persisted status string does not match any variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    /// Which enum was being parsed (e.g. "peer status").
    pub kind: &'static str,
    /// The offending string.
    pub value: String,
}
