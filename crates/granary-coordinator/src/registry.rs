//! Peer registry: registration, heartbeat ingest, and the liveness sweeper.
//!
//! Registration mints a bearer credential that is returned to the peer
//! exactly once; only its SHA-256 is stored, and heartbeats present the
//! credential for a constant-time comparison. The sweeper derives
//! `dead` from heartbeat staleness and orphans the dead peer's active
//! assignments so the repairer sees those replicas as missing.

use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;

use granary_db::queries::{assignments, peers};
use granary_types::clock::now_secs;
use granary_types::{Peer, PeerStatus};

use crate::{CoordError, Db, Result};

/// A registration request from a storage peer.
#[derive(Clone, Debug)]
pub struct RegisterRequest {
    /// Content-addressed id the peer derived from its public key.
    pub peer_id: String,
    pub pubkey: Vec<u8>,
    /// Dialable `host:port` QUIC address.
    pub transport_address: String,
    pub declared_capacity_bytes: u64,
}

/// Registration result; `credential` is shown to the peer exactly once.
#[derive(Clone, Debug)]
pub struct Registration {
    pub peer_id: String,
    pub credential: String,
}

/// Heartbeat acknowledgement.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatAck {
    pub status: PeerStatus,
    pub earned_credits: i64,
}

/// Report of one liveness sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    /// Peers newly marked dead.
    pub died: Vec<String>,
    /// Active assignments orphaned as a result.
    pub orphaned: usize,
}

/// Content-addressed peer id: lowercase hex SHA-256 of the public key.
pub fn peer_id_for(pubkey: &[u8]) -> String {
    hex::encode(Sha256::digest(pubkey))
}

/// Register a new peer, minting its credential.
pub fn register(conn: &Connection, request: &RegisterRequest, now: u64) -> Result<Registration> {
    if request.peer_id != peer_id_for(&request.pubkey) {
        return Err(CoordError::InvalidRequest(
            "peer id is not the hash of the public key".to_string(),
        ));
    }

    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let credential = format!("grn_{}", hex::encode(secret));

    let peer = Peer {
        peer_id: request.peer_id.clone(),
        transport_address: request.transport_address.clone(),
        pubkey: request.pubkey.clone(),
        credential_hash: hex::encode(Sha256::digest(credential.as_bytes())),
        declared_capacity_bytes: request.declared_capacity_bytes,
        used_bytes: 0,
        status: PeerStatus::Active,
        last_heartbeat_at: None,
        rolling_uptime_pct: 100.0,
        earned_credits: 0,
        created_at: now,
    };
    peers::insert(conn, &peer)?;

    tracing::info!(peer_id = %peer.peer_id, "peer registered");
    Ok(Registration {
        peer_id: peer.peer_id,
        credential,
    })
}

/// Verify a presented credential against the stored hash in constant time.
pub fn verify_credential(conn: &Connection, peer_id: &str, presented: &str) -> Result<()> {
    let stored = peers::credential_hash(conn, peer_id).map_err(|_| CoordError::Unauthorized)?;
    let presented_hash = hex::encode(Sha256::digest(presented.as_bytes()));
    if bool::from(stored.as_bytes().ct_eq(presented_hash.as_bytes())) {
        Ok(())
    } else {
        Err(CoordError::Unauthorized)
    }
}

/// Ingest an authenticated heartbeat.
pub fn heartbeat(
    conn: &Connection,
    peer_id: &str,
    presented_credential: &str,
    used_bytes: u64,
    reachable_address: Option<&str>,
    now: u64,
) -> Result<HeartbeatAck> {
    verify_credential(conn, peer_id, presented_credential)?;
    peers::record_heartbeat(conn, peer_id, used_bytes, reachable_address, now)?;

    let peer = peers::get(conn, peer_id)?;
    Ok(HeartbeatAck {
        status: peer.status,
        earned_credits: peer.earned_credits,
    })
}

/// Operator request: stop handing a peer new assignments.
pub fn request_drain(conn: &Connection, peer_id: &str) -> Result<()> {
    let peer = peers::get(conn, peer_id)?;
    match peer.status {
        PeerStatus::Active => {
            peers::set_status(conn, peer_id, PeerStatus::Draining)?;
            Ok(())
        }
        PeerStatus::Draining => Ok(()),
        PeerStatus::Dead => Err(CoordError::InvalidRequest(
            "cannot drain a dead peer".to_string(),
        )),
    }
}

/// Operator request: return a draining peer to service.
pub fn resume(conn: &Connection, peer_id: &str) -> Result<()> {
    let peer = peers::get(conn, peer_id)?;
    match peer.status {
        PeerStatus::Draining => {
            peers::set_status(conn, peer_id, PeerStatus::Active)?;
            Ok(())
        }
        PeerStatus::Active => Ok(()),
        PeerStatus::Dead => Err(CoordError::InvalidRequest(
            "a dead peer resumes by heartbeating".to_string(),
        )),
    }
}

/// One liveness sweep: stale peers die, and their active assignments are
/// orphaned so the repairer refills them.
pub fn sweep(conn: &Connection, now: u64, liveness_window_secs: u64) -> Result<SweepReport> {
    let died = peers::mark_dead_if_stale(conn, now, liveness_window_secs)?;
    let mut orphaned = 0;
    for peer_id in &died {
        orphaned += assignments::orphan_for_peer(conn, peer_id)?;
        tracing::warn!(%peer_id, "peer presumed dead");
    }
    Ok(SweepReport { died, orphaned })
}

/// Run the sweeper until shutdown, once per heartbeat period.
pub async fn run_sweeper(
    db: Db,
    heartbeat_period_secs: u64,
    liveness_window_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(heartbeat_period_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let conn = db.lock().await;
                match sweep(&conn, now_secs(), liveness_window_secs) {
                    Ok(report) if !report.died.is_empty() => {
                        tracing::info!(
                            died = report.died.len(),
                            orphaned = report.orphaned,
                            "liveness sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "liveness sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("liveness sweeper shutting down");
                return;
            }
        }
    }
}
