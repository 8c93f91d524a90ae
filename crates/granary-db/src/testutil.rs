//! Shared fixtures for query tests.

use rusqlite::Connection;
use uuid::Uuid;

use granary_types::{Chunk, File, FileStatus, Peer, PeerStatus};

use crate::queries::{chunks, files, peers};

pub fn test_db() -> Connection {
    crate::open_memory().expect("open test db")
}

pub fn seed_peer(conn: &Connection, id: &str) -> Peer {
    let peer = Peer {
        peer_id: id.to_string(),
        transport_address: "127.0.0.1:4433".to_string(),
        pubkey: vec![7u8; 32],
        credential_hash: "ff".repeat(32),
        declared_capacity_bytes: 1 << 30,
        used_bytes: 0,
        status: PeerStatus::Active,
        last_heartbeat_at: None,
        rolling_uptime_pct: 100.0,
        earned_credits: 0,
        created_at: 1000,
    };
    peers::insert(conn, &peer).expect("seed peer");
    peer
}

pub fn seed_file(conn: &Connection) -> File {
    let file = File {
        file_id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        logical_name: "sample.bin".to_string(),
        plaintext_size_bytes: 4096,
        chunk_count: 1,
        encryption_key: vec![0xAB; 32],
        status: FileStatus::Ready,
        created_at: 1000,
    };
    files::insert(conn, &file).expect("seed file");
    file
}

pub fn seed_chunk(conn: &Connection, file_id: Uuid, index: u32, size: u64) -> Chunk {
    let chunk = Chunk {
        chunk_id: Uuid::new_v4(),
        file_id,
        chunk_index: index,
        ciphertext_hash: "ab".repeat(32),
        ciphertext_size_bytes: size,
        last_verified_at: None,
    };
    chunks::insert(conn, &chunk).expect("seed chunk");
    chunk
}
