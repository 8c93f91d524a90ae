//! Typed payloads for the four granary peer protocols.
//!
//! Each protocol is identified by a stable string carried in the
//! [`Envelope`](crate::wire::Envelope); responders dispatch by matching on
//! it. Payload structs are CBOR-encoded.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push a chunk's ciphertext to a peer.
pub const PROTOCOL_STORE_CHUNK: &str = "/granary/1.0.0/store-chunk";
/// Fetch a chunk's ciphertext back from a peer.
pub const PROTOCOL_RETRIEVE_CHUNK: &str = "/granary/1.0.0/retrieve-chunk";
/// Tell a peer to drop a chunk.
pub const PROTOCOL_DELETE_CHUNK: &str = "/granary/1.0.0/delete-chunk";
/// Challenge a peer to prove possession of a chunk.
pub const PROTOCOL_PROOF_CHALLENGE: &str = "/granary/1.0.0/proof-challenge";
/// Catch-all error reply when a typed response cannot be produced.
pub const PROTOCOL_ERROR: &str = "/granary/1.0.0/error";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreChunkRequest {
    pub chunk_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: u32,
    /// Lowercase hex SHA-256 the receiver must verify before persisting.
    pub ciphertext_hash: String,
    pub size_bytes: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreChunkResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrieveChunkRequest {
    pub chunk_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrieveChunkResponse {
    pub found: bool,
    pub bytes: Vec<u8>,
    /// The hash recorded at store time; callers re-verify against the bytes.
    pub ciphertext_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteChunkRequest {
    pub chunk_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteChunkResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofChallengeRequest {
    pub challenge_id: Uuid,
    pub chunk_id: Uuid,
    pub seed: [u8; 32],
    pub difficulty: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofChallengeResponse {
    pub challenge_id: Uuid,
    /// 64 lowercase hex chars.
    pub proof_hash: String,
    pub duration_ms: u64,
}

/// Error reply used when a handler cannot produce its typed response, e.g.
/// a proof challenge for a chunk the peer does not hold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
