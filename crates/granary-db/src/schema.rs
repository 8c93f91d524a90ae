//! SQL schema definitions.

/// Complete schema for the granary coordinator database, v1.
///
/// Peers are append-only: there is no delete path, so assignment and
/// earnings history always resolves. Files cascade downward — removing a
/// file (after every assignment was told to delete) takes its chunks,
/// staging rows, assignments, and challenges with it.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Peers
-- ============================================================

CREATE TABLE IF NOT EXISTS peers (
    peer_id TEXT PRIMARY KEY,
    transport_address TEXT NOT NULL,
    pubkey BLOB NOT NULL,
    credential_hash TEXT NOT NULL,
    declared_capacity_bytes INTEGER NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    last_heartbeat_at INTEGER,
    rolling_uptime_pct REAL NOT NULL DEFAULT 100.0,
    earned_credits INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_heartbeats (
    peer_id TEXT NOT NULL REFERENCES peers(peer_id),
    day INTEGER NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (peer_id, day)
);

-- ============================================================
-- Files & chunks
-- ============================================================

CREATE TABLE IF NOT EXISTS files (
    file_id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    logical_name TEXT NOT NULL,
    plaintext_size_bytes INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    encryption_key BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'uploading',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner_id);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    ciphertext_hash TEXT NOT NULL,
    ciphertext_size_bytes INTEGER NOT NULL,
    last_verified_at INTEGER,
    UNIQUE (file_id, chunk_index)
);

-- Transient ciphertext held only between upload and full replication.
CREATE TABLE IF NOT EXISTS chunk_staging (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(chunk_id) ON DELETE CASCADE,
    ciphertext BLOB NOT NULL
);

-- ============================================================
-- Assignments
-- ============================================================

CREATE TABLE IF NOT EXISTS chunk_assignments (
    assignment_id TEXT PRIMARY KEY,
    chunk_id TEXT NOT NULL REFERENCES chunks(chunk_id) ON DELETE CASCADE,
    peer_id TEXT NOT NULL REFERENCES peers(peer_id),
    state TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL
);

-- At most one non-deleted assignment per (chunk, peer).
CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_live
    ON chunk_assignments(chunk_id, peer_id) WHERE state != 'deleted';

CREATE INDEX IF NOT EXISTS idx_assignments_chunk ON chunk_assignments(chunk_id);
CREATE INDEX IF NOT EXISTS idx_assignments_peer ON chunk_assignments(peer_id);

-- ============================================================
-- Proof challenges
-- ============================================================

CREATE TABLE IF NOT EXISTS proof_challenges (
    challenge_id TEXT PRIMARY KEY,
    chunk_id TEXT NOT NULL REFERENCES chunks(chunk_id) ON DELETE CASCADE,
    peer_id TEXT NOT NULL REFERENCES peers(peer_id),
    seed BLOB NOT NULL,
    difficulty INTEGER NOT NULL,
    issued_at INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    proof_hash TEXT,
    duration_ms INTEGER,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_challenges_peer ON proof_challenges(peer_id, issued_at);

-- ============================================================
-- Earnings
-- ============================================================

CREATE TABLE IF NOT EXISTS peer_earnings (
    peer_id TEXT NOT NULL REFERENCES peers(peer_id),
    day INTEGER NOT NULL,
    storage_bytes INTEGER NOT NULL,
    gross_credits INTEGER NOT NULL,
    uptime_penalty INTEGER NOT NULL,
    proof_penalty INTEGER NOT NULL,
    net_credits INTEGER NOT NULL,
    PRIMARY KEY (peer_id, day)
);
"#;
