//! Verified ciphertext retrieval from replicas.
//!
//! The repairer, the proof verifier, and the download path all need the same
//! primitive: fetch a chunk's bytes from some peer that holds it, and trust
//! nothing until the bytes hash to the recorded `ciphertext_hash`. A peer
//! that answers with missing or tampered bytes has its assignment marked
//! `failed` on the spot, which is what makes the next repair cycle treat
//! that replica as gone.

use std::time::Duration;

use sha2::{Digest, Sha256};

use granary_db::queries::assignments;
use granary_transport::messages::{
    RetrieveChunkRequest, RetrieveChunkResponse, PROTOCOL_RETRIEVE_CHUNK,
};
use granary_transport::quic::{self, QuicNode};
use granary_transport::wire::Envelope;
use granary_types::{AssignmentState, Chunk, Peer};

use crate::{CoordError, Db, Result};

/// Ciphertext fetched from a live replica.
#[derive(Debug)]
pub struct FetchedCiphertext {
    pub bytes: Vec<u8>,
    /// The peer that served the bytes.
    pub peer_id: String,
}

/// Try each of the chunk's `active` replicas in turn until one returns
/// bytes matching `ciphertext_hash`.
///
/// `exclude_peer` removes one peer from consideration (the proof verifier
/// must not trust the peer it is challenging). Peers that answer with
/// wrong or missing bytes are marked `failed`; unreachable peers are
/// skipped without prejudice.
pub async fn from_replica(
    db: &Db,
    node: &QuicNode,
    chunk: &Chunk,
    exclude_peer: Option<&str>,
    per_attempt: Duration,
) -> Result<FetchedCiphertext> {
    let candidates: Vec<(uuid::Uuid, Peer)> = {
        let conn = db.lock().await;
        let mut out = Vec::new();
        for assignment in assignments::active_for_chunk(&conn, chunk.chunk_id)? {
            if exclude_peer == Some(assignment.peer_id.as_str()) {
                continue;
            }
            let peer = granary_db::queries::peers::get(&conn, &assignment.peer_id)?;
            out.push((assignment.assignment_id, peer));
        }
        out
    };

    for (assignment_id, peer) in candidates {
        match fetch_one(node, chunk, &peer, per_attempt).await {
            Ok(bytes) => {
                return Ok(FetchedCiphertext {
                    bytes,
                    peer_id: peer.peer_id,
                })
            }
            Err(CoordError::HashMismatch { .. }) | Err(CoordError::NotFound(_)) => {
                tracing::warn!(
                    chunk_id = %chunk.chunk_id,
                    peer_id = %peer.peer_id,
                    "replica unhealthy, failing assignment"
                );
                let conn = db.lock().await;
                assignments::set_state(&conn, assignment_id, AssignmentState::Failed)?;
            }
            Err(e) => {
                tracing::debug!(
                    chunk_id = %chunk.chunk_id,
                    peer_id = %peer.peer_id,
                    error = %e,
                    "replica unreachable, trying next"
                );
            }
        }
    }

    Err(CoordError::NoSource(chunk.chunk_id))
}

/// Fetch and hash-verify a chunk from one specific peer. The proof
/// verifier uses this directly for its last-resort source: the challenged
/// peer itself.
pub(crate) async fn from_peer(
    node: &QuicNode,
    chunk: &Chunk,
    peer: &Peer,
    per_attempt: Duration,
) -> Result<Vec<u8>> {
    fetch_one(node, chunk, peer, per_attempt).await
}

/// Fetch and hash-verify a chunk from one peer.
async fn fetch_one(
    node: &QuicNode,
    chunk: &Chunk,
    peer: &Peer,
    per_attempt: Duration,
) -> Result<Vec<u8>> {
    let addr = quic::parse_addr(&peer.transport_address)?;
    let connection = node.connect(addr).await?;
    let request = Envelope::new(
        PROTOCOL_RETRIEVE_CHUNK,
        &RetrieveChunkRequest {
            chunk_id: chunk.chunk_id,
        },
    )?;
    let response = quic::request(&connection, &request, per_attempt).await?;
    let body: RetrieveChunkResponse = response.decode_payload()?;

    if !body.found {
        return Err(CoordError::NotFound(format!(
            "chunk {} on peer {}",
            chunk.chunk_id, peer.peer_id
        )));
    }

    let computed = hex::encode(Sha256::digest(&body.bytes));
    if computed != chunk.ciphertext_hash {
        return Err(CoordError::HashMismatch {
            chunk_id: chunk.chunk_id,
            expected: chunk.ciphertext_hash.clone(),
            computed,
        });
    }

    Ok(body.bytes)
}
