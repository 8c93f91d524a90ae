//! Shared harness for the end-to-end scenarios.
//!
//! Spins up real storage peers — a chunk store in a temp directory behind a
//! QUIC responder on an ephemeral localhost port — and seeds the
//! coordinator's metadata store to point at them. Tests then drive the
//! coordinator components (distributor, repairer, scheduler, file service)
//! against genuine network I/O.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use granary_chunkstore::ChunkStore;
use granary_coordinator::Db;
use granary_db::queries::{chunks, files, peers};
use granary_node::responder::Responder;
use granary_transport::messages::{
    ProofChallengeRequest, ProofChallengeResponse, RetrieveChunkResponse, PROTOCOL_PROOF_CHALLENGE,
    PROTOCOL_RETRIEVE_CHUNK,
};
use granary_transport::quic::{QuicConfig, QuicNode};
use granary_transport::wire::{self, Envelope};
use granary_types::clock::now_secs;
use granary_types::{Chunk, File, FileStatus, Peer, PeerStatus};

/// A live storage peer under test.
pub struct TestPeer {
    pub peer_id: String,
    pub addr: SocketAddr,
    pub store: Arc<ChunkStore>,
    pub draining: Arc<AtomicBool>,
    node: Arc<QuicNode>,
    shutdown: broadcast::Sender<()>,
    _dir: tempfile::TempDir,
}

impl TestPeer {
    /// Start a real responder on an ephemeral port.
    pub fn spawn(peer_id: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(ChunkStore::open(dir.path()).expect("open store"));
        let node = Arc::new(bind_node());
        let addr = node.local_addr();
        let draining = Arc::new(AtomicBool::new(false));
        let (shutdown, _) = broadcast::channel(1);

        let responder = Responder::new(node.clone(), store.clone(), draining.clone());
        tokio::spawn(responder.run(shutdown.subscribe()));

        Self {
            peer_id: peer_id.to_string(),
            addr,
            store,
            draining,
            node,
            shutdown,
            _dir: dir,
        }
    }

    /// Kill the peer: no more streams are answered.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        self.node.close(0, b"peer stopped");
    }
}

/// Bind a QUIC node on an ephemeral localhost port.
pub fn bind_node() -> QuicNode {
    QuicNode::bind(QuicConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        ..QuicConfig::default()
    })
    .expect("bind")
}

/// Fresh in-memory coordinator store.
pub fn coordinator_db() -> Db {
    Arc::new(tokio::sync::Mutex::new(
        granary_db::open_memory().expect("open db"),
    ))
}

/// Record a peer row pointing at a live test peer, heartbeating now.
pub async fn seed_peer_row(db: &Db, peer: &TestPeer, capacity_bytes: u64) {
    seed_peer_row_at(db, peer, capacity_bytes, now_secs()).await;
}

/// Record a peer row with an explicit last-heartbeat time.
pub async fn seed_peer_row_at(db: &Db, peer: &TestPeer, capacity_bytes: u64, heartbeat_at: u64) {
    let conn = db.lock().await;
    peers::insert(
        &conn,
        &Peer {
            peer_id: peer.peer_id.clone(),
            transport_address: peer.addr.to_string(),
            pubkey: vec![0u8; 32],
            credential_hash: "00".repeat(32),
            declared_capacity_bytes: capacity_bytes,
            used_bytes: 0,
            status: PeerStatus::Active,
            last_heartbeat_at: None,
            rolling_uptime_pct: 100.0,
            earned_credits: 0,
            created_at: heartbeat_at,
        },
    )
    .expect("insert peer");
    peers::record_heartbeat(&conn, &peer.peer_id, 0, None, heartbeat_at).expect("heartbeat");
}

/// Record a ready file with one chunk holding `bytes`, returning the chunk.
pub async fn seed_chunk_row(db: &Db, bytes: &[u8]) -> Chunk {
    use sha2::{Digest, Sha256};

    let conn = db.lock().await;
    let file = File {
        file_id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        logical_name: "scenario.bin".to_string(),
        plaintext_size_bytes: bytes.len() as u64,
        chunk_count: 1,
        encryption_key: vec![0u8; 32],
        status: FileStatus::Ready,
        created_at: now_secs(),
    };
    files::insert(&conn, &file).expect("insert file");

    let chunk = Chunk {
        chunk_id: Uuid::new_v4(),
        file_id: file.file_id,
        chunk_index: 0,
        ciphertext_hash: hex::encode(Sha256::digest(bytes)),
        ciphertext_size_bytes: bytes.len() as u64,
        last_verified_at: None,
    };
    chunks::insert(&conn, &chunk).expect("insert chunk");
    chunks::put_staging(&conn, chunk.chunk_id, bytes).expect("stage");
    chunk
}

/// A deliberately misbehaving peer for fault-injection scenarios.
pub struct FaultyPeer {
    pub addr: SocketAddr,
    node: Arc<QuicNode>,
}

/// What the faulty peer does with requests.
#[derive(Clone)]
pub enum Fault {
    /// Answer retrieve-chunk with these bytes and this claimed hash,
    /// regardless of what was asked for.
    TamperedBytes { bytes: Vec<u8>, claimed_hash: String },
    /// Answer proof challenges correctly over `bytes`, but only after a
    /// synthetic delay.
    SlowProof { bytes: Vec<u8>, delay: Duration },
}

impl FaultyPeer {
    pub fn spawn(fault: Fault) -> Self {
        let node = Arc::new(bind_node());
        let addr = node.local_addr();

        let accept_node = node.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_node.accept().await {
                let Ok(connection) = incoming.await else {
                    continue;
                };
                let fault = fault.clone();
                tokio::spawn(async move {
                    while let Ok((mut send, mut recv)) = QuicNode::accept_bi(&connection).await {
                        let Ok(request) = wire::recv_envelope(&mut recv).await else {
                            return;
                        };
                        let Ok(reply) = answer(&fault, &request).await else {
                            return;
                        };
                        if wire::send_envelope(&mut send, &reply).await.is_err() {
                            return;
                        }
                        let _ = send.finish();
                    }
                });
            }
        });

        Self { addr, node }
    }

    pub fn stop(&self) {
        self.node.close(0, b"faulty peer stopped");
    }
}

async fn answer(fault: &Fault, request: &Envelope) -> granary_transport::Result<Envelope> {
    match (fault, request.protocol.as_str()) {
        (Fault::TamperedBytes { bytes, claimed_hash }, PROTOCOL_RETRIEVE_CHUNK) => Envelope::new(
            PROTOCOL_RETRIEVE_CHUNK,
            &RetrieveChunkResponse {
                found: true,
                bytes: bytes.clone(),
                ciphertext_hash: claimed_hash.clone(),
            },
        ),
        (Fault::SlowProof { bytes, delay }, PROTOCOL_PROOF_CHALLENGE) => {
            let body: ProofChallengeRequest = request.decode_payload()?;
            let start = std::time::Instant::now();
            tokio::time::sleep(*delay).await;
            let proof_hash = granary_proof::compute(&body.seed, bytes, body.difficulty);
            Envelope::new(
                PROTOCOL_PROOF_CHALLENGE,
                &ProofChallengeResponse {
                    challenge_id: body.challenge_id,
                    proof_hash,
                    duration_ms: start.elapsed().as_millis() as u64,
                },
            )
        }
        _ => Envelope::new(
            granary_transport::messages::PROTOCOL_ERROR,
            &granary_transport::messages::ErrorResponse {
                error: "faulty peer: unsupported request".to_string(),
            },
        ),
    }
}

/// Insert a peer row pointing at a faulty peer.
pub async fn seed_faulty_peer_row(db: &Db, peer_id: &str, addr: SocketAddr, capacity_bytes: u64) {
    let conn = db.lock().await;
    peers::insert(
        &conn,
        &Peer {
            peer_id: peer_id.to_string(),
            transport_address: addr.to_string(),
            pubkey: vec![0u8; 32],
            credential_hash: "00".repeat(32),
            declared_capacity_bytes: capacity_bytes,
            used_bytes: 0,
            status: PeerStatus::Active,
            last_heartbeat_at: None,
            rolling_uptime_pct: 100.0,
            earned_credits: 0,
            created_at: now_secs(),
        },
    )
    .expect("insert peer");
    peers::record_heartbeat(&conn, peer_id, 0, None, now_secs()).expect("heartbeat");
}
