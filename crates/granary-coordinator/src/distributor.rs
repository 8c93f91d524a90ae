//! Chunk distribution: fan a chunk out to its selected peers.
//!
//! For each peer the distributor writes a `pending` assignment, opens a
//! stream, pushes the ciphertext, and awaits the ack. Success moves the
//! assignment to `active` and charges the peer's `used_bytes`; failure
//! after all retries moves it to `failed`. Fan-out is parallel across
//! peers, with at most five in-flight transfers per peer.
//!
//! Partial success is not an error: one stored replica is enough to return
//! success and hand the shortfall to the repairer. Zero stored replicas is
//! a transient failure the upload caller decides about.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use granary_db::queries::{assignments, peers};
use granary_transport::messages::{StoreChunkRequest, StoreChunkResponse, PROTOCOL_STORE_CHUNK};
use granary_transport::quic::{self, QuicNode};
use granary_transport::wire::Envelope;
use granary_transport::TransportError;
use granary_types::clock::now_secs;
use granary_types::{AssignmentState, Chunk, Peer, PeerStatus};

use crate::{CoordError, Db, Result};

/// Distribution tunables.
#[derive(Clone, Debug)]
pub struct DistributorConfig {
    /// Replica target; fewer successes than this enqueues a repair.
    pub replicas: u32,
    /// Transfer attempts per peer.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_cap: Duration,
    /// In-flight transfer bound per peer.
    pub per_peer_concurrency: usize,
    /// Floor for the per-attempt transfer deadline.
    pub transfer_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
            per_peer_concurrency: 5,
            transfer_timeout: Duration::from_secs(60),
        }
    }
}

impl DistributorConfig {
    /// Delay before the given retry (1-based): `base * 2^(attempt-1)`,
    /// capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        doubled.min(self.backoff_cap)
    }

    /// Per-attempt deadline for a transfer of `size_bytes`: the configured
    /// floor, stretched for oversized payloads.
    fn transfer_deadline(&self, size_bytes: u64) -> Duration {
        let scaled = Duration::from_millis(size_bytes / 64);
        self.transfer_timeout.max(scaled)
    }
}

/// Result of a distribute call.
#[derive(Clone, Copy, Debug)]
pub struct DistributeOutcome {
    /// Peers that acknowledged the chunk.
    pub success_count: usize,
    /// Peers a transfer was actually attempted against (conflict skips
    /// excluded).
    pub attempted: usize,
}

/// The chunk distributor.
pub struct Distributor {
    db: Db,
    node: Arc<QuicNode>,
    config: DistributorConfig,
    semaphores: tokio::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
    repair_tx: mpsc::UnboundedSender<Uuid>,
}

impl Distributor {
    pub fn new(
        db: Db,
        node: Arc<QuicNode>,
        config: DistributorConfig,
        repair_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            db,
            node,
            config,
            semaphores: tokio::sync::Mutex::new(HashMap::new()),
            repair_tx,
        }
    }

    /// Fan `ciphertext` out to `peers`.
    ///
    /// Returns [`CoordError::NoReplicasStored`] when every transfer failed;
    /// otherwise reports the success count, enqueueing a repair when the
    /// count is short of the replica target.
    pub async fn distribute(
        &self,
        chunk: &Chunk,
        ciphertext: Arc<Vec<u8>>,
        peers: &[Peer],
    ) -> Result<DistributeOutcome> {
        let mut tasks: JoinSet<bool> = JoinSet::new();
        let mut attempted = 0usize;

        for peer in peers {
            let assignment_id = Uuid::new_v4();
            let inserted = {
                let conn = self.db.lock().await;
                assignments::insert_pending(&conn, assignment_id, chunk.chunk_id, &peer.peer_id, now_secs())
            };
            match inserted {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        chunk_id = %chunk.chunk_id,
                        peer_id = %peer.peer_id,
                        "peer already assigned, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            attempted += 1;

            let semaphore = self.peer_semaphore(&peer.peer_id).await;
            let db = self.db.clone();
            let node = self.node.clone();
            let config = self.config.clone();
            let chunk = chunk.clone();
            let ciphertext = ciphertext.clone();
            let peer = peer.clone();

            tasks.spawn(async move {
                // Holds a per-peer slot for the whole transfer.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return false,
                };

                let result = transfer_with_retries(&node, &config, &chunk, &ciphertext, &peer).await;

                let conn = db.lock().await;
                match result {
                    Ok(()) => {
                        let ok = assignments::set_state(&conn, assignment_id, AssignmentState::Active)
                            .and_then(|_| {
                                peers::add_used_bytes(
                                    &conn,
                                    &peer.peer_id,
                                    chunk.ciphertext_size_bytes as i64,
                                )
                            });
                        if let Err(e) = ok {
                            tracing::error!(
                                chunk_id = %chunk.chunk_id,
                                peer_id = %peer.peer_id,
                                error = %e,
                                "failed to record successful transfer"
                            );
                            return false;
                        }
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            chunk_id = %chunk.chunk_id,
                            peer_id = %peer.peer_id,
                            error = %e,
                            "transfer failed after retries"
                        );
                        if let Err(db_err) =
                            assignments::set_state(&conn, assignment_id, AssignmentState::Failed)
                        {
                            tracing::error!(error = %db_err, "failed to mark assignment failed");
                        }
                        false
                    }
                }
            });
        }

        let mut success_count = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                success_count += 1;
            }
        }

        if attempted > 0 && success_count == 0 {
            return Err(CoordError::NoReplicasStored(chunk.chunk_id));
        }

        let live = {
            let conn = self.db.lock().await;
            assignments::count_active(&conn, chunk.chunk_id)?
        };
        if success_count >= 1 && live < self.config.replicas {
            tracing::info!(
                chunk_id = %chunk.chunk_id,
                live,
                target = self.config.replicas,
                "under target after distribution, enqueueing repair"
            );
            let _ = self.repair_tx.send(chunk.chunk_id);
        }

        Ok(DistributeOutcome {
            success_count,
            attempted,
        })
    }

    /// Tell every non-deleted holder of `chunk` to drop it, moving the
    /// assignments to `deleted` and releasing `used_bytes`. Unreachable
    /// live peers keep their assignment for a later retry; dead peers are
    /// tombstoned directly. Returns how many assignments remain undeleted.
    pub async fn delete_replicas(&self, chunk: &Chunk) -> Result<usize> {
        let rows = {
            let conn = self.db.lock().await;
            let mut out = Vec::new();
            for assignment in assignments::for_chunk(&conn, chunk.chunk_id)? {
                if assignment.state == AssignmentState::Deleted {
                    continue;
                }
                let peer = peers::get(&conn, &assignment.peer_id)?;
                out.push((assignment, peer));
            }
            out
        };

        let mut remaining = 0usize;
        for (assignment, peer) in rows {
            let counted = matches!(
                assignment.state,
                AssignmentState::Active | AssignmentState::Orphaned
            );

            let reachable = peer.status != PeerStatus::Dead;
            let confirmed = if reachable {
                delete_on_peer(&self.node, &peer, chunk.chunk_id).await.is_ok()
            } else {
                false
            };

            if confirmed || !reachable {
                let conn = self.db.lock().await;
                assignments::set_state(&conn, assignment.assignment_id, AssignmentState::Deleted)?;
                if counted {
                    peers::add_used_bytes(
                        &conn,
                        &peer.peer_id,
                        -(chunk.ciphertext_size_bytes as i64),
                    )?;
                }
            } else {
                remaining += 1;
            }
        }
        Ok(remaining)
    }

    async fn peer_semaphore(&self, peer_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().await;
        semaphores
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_peer_concurrency)))
            .clone()
    }
}

/// Run a transfer with exponential backoff. Transport-level failures retry;
/// a deterministic rejection by the peer does not.
async fn transfer_with_retries(
    node: &QuicNode,
    config: &DistributorConfig,
    chunk: &Chunk,
    ciphertext: &[u8],
    peer: &Peer,
) -> Result<()> {
    let mut last_err = CoordError::Transport(TransportError::Connection("no attempt made".into()));
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(config.backoff_delay(attempt)).await;
        }
        match transfer_once(node, config, chunk, ciphertext, peer).await {
            Ok(()) => return Ok(()),
            Err(CoordError::Transport(e))
                if matches!(
                    e,
                    TransportError::Timeout(_)
                        | TransportError::Connection(_)
                        | TransportError::Io(_)
                ) =>
            {
                tracing::debug!(
                    chunk_id = %chunk.chunk_id,
                    peer_id = %peer.peer_id,
                    attempt = attempt + 1,
                    error = %e,
                    "transfer attempt failed"
                );
                last_err = CoordError::Transport(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

async fn transfer_once(
    node: &QuicNode,
    config: &DistributorConfig,
    chunk: &Chunk,
    ciphertext: &[u8],
    peer: &Peer,
) -> Result<()> {
    let addr = quic::parse_addr(&peer.transport_address)?;
    let deadline = config.transfer_deadline(chunk.ciphertext_size_bytes);

    let exchange = async {
        let connection = node.connect(addr).await?;
        let request = Envelope::new(
            PROTOCOL_STORE_CHUNK,
            &StoreChunkRequest {
                chunk_id: chunk.chunk_id,
                file_id: chunk.file_id,
                chunk_index: chunk.chunk_index,
                ciphertext_hash: chunk.ciphertext_hash.clone(),
                size_bytes: chunk.ciphertext_size_bytes,
                bytes: ciphertext.to_vec(),
            },
        )?;
        quic::request(&connection, &request, deadline).await
    };
    let response = tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| TransportError::Timeout(deadline.as_millis() as u64))??;

    let body: StoreChunkResponse = response.decode_payload().map_err(CoordError::Transport)?;
    if body.success {
        Ok(())
    } else {
        Err(CoordError::Transport(TransportError::Remote(
            body.error.unwrap_or_else(|| "store rejected".to_string()),
        )))
    }
}

async fn delete_on_peer(node: &QuicNode, peer: &Peer, chunk_id: Uuid) -> Result<()> {
    let addr = quic::parse_addr(&peer.transport_address)?;
    let connection = node.connect(addr).await?;
    let request = Envelope::new(
        granary_transport::messages::PROTOCOL_DELETE_CHUNK,
        &granary_transport::messages::DeleteChunkRequest { chunk_id },
    )?;
    let response = quic::request(&connection, &request, Duration::from_secs(30)).await?;
    let body: granary_transport::messages::DeleteChunkResponse =
        response.decode_payload().map_err(CoordError::Transport)?;
    if body.success {
        Ok(())
    } else {
        Err(CoordError::Transport(TransportError::Remote(
            "delete rejected".to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_db::queries::{chunks, files};
    use granary_types::{File, FileStatus};

    #[test]
    fn test_backoff_doubles_to_cap() {
        let config = DistributorConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn test_transfer_deadline_floors_at_default() {
        let config = DistributorConfig::default();
        assert_eq!(config.transfer_deadline(262_144), Duration::from_secs(60));
        // A pathological payload stretches the deadline past the floor.
        assert!(config.transfer_deadline(64 * 120_000 * 1000) > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_distribute_marks_failed_when_unreachable() {
        let db = crate::test_db();
        let node = Arc::new(
            QuicNode::bind(granary_transport::quic::QuicConfig {
                bind_addr: "127.0.0.1:0".parse().expect("addr"),
                ..Default::default()
            })
            .expect("bind"),
        );
        let (repair_tx, mut repair_rx) = mpsc::unbounded_channel();

        let (chunk, peer) = {
            let conn = db.lock().await;
            let file = File {
                file_id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                logical_name: "f".to_string(),
                plaintext_size_bytes: 5,
                chunk_count: 1,
                encryption_key: vec![0u8; 32],
                status: FileStatus::Uploading,
                created_at: 0,
            };
            files::insert(&conn, &file).expect("file");
            let chunk = Chunk {
                chunk_id: Uuid::new_v4(),
                file_id: file.file_id,
                chunk_index: 0,
                ciphertext_hash: "00".repeat(32),
                ciphertext_size_bytes: 5,
                last_verified_at: None,
            };
            chunks::insert(&conn, &chunk).expect("chunk");
            let peer = Peer {
                peer_id: "unreachable".to_string(),
                // Nothing listens here; connection attempts fail fast.
                transport_address: "127.0.0.1:1".to_string(),
                pubkey: vec![0u8; 32],
                credential_hash: String::new(),
                declared_capacity_bytes: 1 << 20,
                used_bytes: 0,
                status: PeerStatus::Active,
                last_heartbeat_at: Some(now_secs()),
                rolling_uptime_pct: 100.0,
                earned_credits: 0,
                created_at: 0,
            };
            peers::insert(&conn, &peer).expect("peer");
            (chunk, peer)
        };

        let distributor = Distributor::new(
            db.clone(),
            node,
            DistributorConfig {
                max_attempts: 1,
                transfer_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            repair_tx,
        );

        let result = distributor
            .distribute(&chunk, Arc::new(b"hello".to_vec()), &[peer])
            .await;
        assert!(matches!(result, Err(CoordError::NoReplicasStored(_))));

        let conn = db.lock().await;
        let rows = assignments::for_chunk(&conn, chunk.chunk_id).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, AssignmentState::Failed);
        assert_eq!(peers::get(&conn, "unreachable").expect("peer").used_bytes, 0);
        assert!(repair_rx.try_recv().is_err());
    }
}
