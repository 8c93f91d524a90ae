//! Placement planning: which peers receive a chunk.
//!
//! A peer is eligible when it is `active`, its heartbeat falls inside the
//! liveness window, it has capacity for the ciphertext, and it does not
//! already hold the chunk in any non-deleted state. Eligible peers are
//! ranked by (1) highest free-capacity fraction, (2) lowest live assignment
//! workload, (3) a stable hash of `(chunk_id, peer_id)` so equal peers sort
//! the same way on every coordinator.

use std::cmp::Ordering;
use std::collections::HashSet;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use granary_db::queries::{assignments, peers};
use granary_types::Peer;

use crate::{CoordError, Result};

/// One placement request.
#[derive(Clone, Copy, Debug)]
pub struct PlacementRequest {
    pub chunk_id: Uuid,
    pub ciphertext_size_bytes: u64,
    /// How many new peers the caller needs.
    pub needed: usize,
    pub now: u64,
    pub liveness_window_secs: u64,
}

/// Pick `needed` peers for a chunk, best candidates first.
///
/// Fails with [`CoordError::InsufficientCapacity`] when fewer than `needed`
/// peers are eligible.
pub fn plan(conn: &Connection, request: &PlacementRequest) -> Result<Vec<Peer>> {
    let holders: HashSet<String> = assignments::holders(conn, request.chunk_id)?
        .into_iter()
        .collect();
    let workload = assignments::live_workload_by_peer(conn)?;

    let mut eligible: Vec<Peer> = peers::list_active(conn)?
        .into_iter()
        .filter(|peer| {
            peer.heartbeat_fresh(request.now, request.liveness_window_secs)
                && peer.free_bytes() >= request.ciphertext_size_bytes
                && !holders.contains(&peer.peer_id)
        })
        .collect();

    if eligible.len() < request.needed {
        return Err(CoordError::InsufficientCapacity {
            needed: request.needed,
            eligible: eligible.len(),
        });
    }

    eligible.sort_by(|a, b| {
        b.free_fraction()
            .partial_cmp(&a.free_fraction())
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let wa = workload.get(&a.peer_id).copied().unwrap_or(0);
                let wb = workload.get(&b.peer_id).copied().unwrap_or(0);
                wa.cmp(&wb)
            })
            .then_with(|| {
                tiebreak(request.chunk_id, &a.peer_id).cmp(&tiebreak(request.chunk_id, &b.peer_id))
            })
    });

    eligible.truncate(request.needed);
    Ok(eligible)
}

/// Deterministic tiebreak: the first eight bytes of
/// `SHA-256(chunk_id ∥ peer_id)` as a big-endian integer.
fn tiebreak(chunk_id: Uuid, peer_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    hasher.update(peer_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_db::queries::assignments as asg;
    use granary_types::{AssignmentState, Chunk, File, FileStatus, Peer, PeerStatus};

    fn conn() -> Connection {
        granary_db::open_memory().expect("open")
    }

    fn add_peer(conn: &Connection, id: &str, capacity: u64, used: u64, heartbeat: Option<u64>) {
        peers::insert(
            conn,
            &Peer {
                peer_id: id.to_string(),
                transport_address: "127.0.0.1:4433".to_string(),
                pubkey: vec![1u8; 32],
                credential_hash: String::new(),
                declared_capacity_bytes: capacity,
                used_bytes: used,
                status: PeerStatus::Active,
                last_heartbeat_at: heartbeat,
                rolling_uptime_pct: 100.0,
                earned_credits: 0,
                created_at: 0,
            },
        )
        .expect("insert peer");
    }

    fn add_chunk(conn: &Connection, size: u64) -> Uuid {
        let file = File {
            file_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            logical_name: "f".to_string(),
            plaintext_size_bytes: size,
            chunk_count: 1,
            encryption_key: vec![0u8; 32],
            status: FileStatus::Ready,
            created_at: 0,
        };
        granary_db::queries::files::insert(conn, &file).expect("file");
        let chunk = Chunk {
            chunk_id: Uuid::new_v4(),
            file_id: file.file_id,
            chunk_index: 0,
            ciphertext_hash: "00".repeat(32),
            ciphertext_size_bytes: size,
            last_verified_at: None,
        };
        granary_db::queries::chunks::insert(conn, &chunk).expect("chunk");
        chunk.chunk_id
    }

    fn request(chunk_id: Uuid, size: u64, needed: usize) -> PlacementRequest {
        PlacementRequest {
            chunk_id,
            ciphertext_size_bytes: size,
            needed,
            now: 1000,
            liveness_window_secs: 90,
        }
    }

    #[test]
    fn test_prefers_freest_peer() {
        let conn = conn();
        add_peer(&conn, "full", 1000, 900, Some(990));
        add_peer(&conn, "empty", 1000, 0, Some(990));
        let chunk = add_chunk(&conn, 50);

        let picked = plan(&conn, &request(chunk, 50, 1)).expect("plan");
        assert_eq!(picked[0].peer_id, "empty");
    }

    #[test]
    fn test_skips_stale_and_undersized_peers() {
        let conn = conn();
        add_peer(&conn, "stale", 1000, 0, Some(100));
        add_peer(&conn, "silent", 1000, 0, None);
        add_peer(&conn, "tiny", 10, 0, Some(990));
        add_peer(&conn, "good", 1000, 0, Some(990));
        let chunk = add_chunk(&conn, 50);

        let picked = plan(&conn, &request(chunk, 50, 1)).expect("plan");
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].peer_id, "good");
    }

    #[test]
    fn test_excludes_existing_holders() {
        let conn = conn();
        add_peer(&conn, "holder", 1000, 0, Some(990));
        add_peer(&conn, "fresh", 1000, 0, Some(990));
        let chunk = add_chunk(&conn, 50);

        let a = Uuid::new_v4();
        asg::insert_pending(&conn, a, chunk, "holder", 900).expect("assign");
        asg::set_state(&conn, a, AssignmentState::Active).expect("activate");

        let picked = plan(&conn, &request(chunk, 50, 1)).expect("plan");
        assert_eq!(picked[0].peer_id, "fresh");

        // Even a failed edge keeps the pair excluded.
        let b = Uuid::new_v4();
        asg::insert_pending(&conn, b, chunk, "fresh", 901).expect("assign");
        asg::set_state(&conn, b, AssignmentState::Failed).expect("fail");
        let err = plan(&conn, &request(chunk, 50, 1)).unwrap_err();
        assert!(matches!(err, CoordError::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_insufficient_capacity_reports_counts() {
        let conn = conn();
        add_peer(&conn, "only", 1000, 0, Some(990));
        let chunk = add_chunk(&conn, 50);

        match plan(&conn, &request(chunk, 50, 3)).unwrap_err() {
            CoordError::InsufficientCapacity { needed, eligible } => {
                assert_eq!(needed, 3);
                assert_eq!(eligible, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_workload_breaks_capacity_ties() {
        let conn = conn();
        add_peer(&conn, "busy", 1000, 0, Some(990));
        add_peer(&conn, "idle", 1000, 0, Some(990));
        let loaded_chunk = add_chunk(&conn, 10);
        asg::insert_pending(&conn, Uuid::new_v4(), loaded_chunk, "busy", 900).expect("assign");

        let chunk = add_chunk(&conn, 50);
        let picked = plan(&conn, &request(chunk, 50, 2)).expect("plan");
        assert_eq!(picked[0].peer_id, "idle");
        assert_eq!(picked[1].peer_id, "busy");
    }

    #[test]
    fn test_tiebreak_is_stable() {
        let chunk_id = Uuid::new_v4();
        assert_eq!(tiebreak(chunk_id, "peer-a"), tiebreak(chunk_id, "peer-a"));
        assert_ne!(tiebreak(chunk_id, "peer-a"), tiebreak(chunk_id, "peer-b"));
    }

    #[test]
    fn test_deterministic_ordering_for_equal_peers() {
        let conn = conn();
        add_peer(&conn, "pa", 1000, 0, Some(990));
        add_peer(&conn, "pb", 1000, 0, Some(990));
        add_peer(&conn, "pc", 1000, 0, Some(990));
        let chunk = add_chunk(&conn, 50);

        let first = plan(&conn, &request(chunk, 50, 3)).expect("plan");
        let second = plan(&conn, &request(chunk, 50, 3)).expect("plan");
        let ids = |peers: &[Peer]| peers.iter().map(|p| p.peer_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }
}
