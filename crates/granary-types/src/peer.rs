//! Storage peers as the coordinator tracks them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseStatusError;

/// Lifecycle status of a storage peer.
///
/// `Active ⇄ Draining` on operator request; `Active → Dead` when heartbeats
/// stop for longer than the liveness window; `Dead → Active` on a successful
/// heartbeat. Peers are never deleted, so historical assignments stay
/// referentially valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Reachable and accepting new assignments.
    Active,
    /// Finishing existing work; accepts no new assignments.
    Draining,
    /// Presumed gone; its replicas count as missing.
    Dead,
}

impl PeerStatus {
    /// Stable string form used in the database and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Active => "active",
            PeerStatus::Draining => "draining",
            PeerStatus::Dead => "dead",
        }
    }
}

impl FromStr for PeerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PeerStatus::Active),
            "draining" => Ok(PeerStatus::Draining),
            "dead" => Ok(PeerStatus::Dead),
            other => Err(ParseStatusError {
                kind: "peer status",
                value: other.to_string(),
            }),
        }
    }
}

/// A registered storage peer.
///
/// `peer_id` is content-addressed (hex SHA-256 of the peer's public key) and
/// stable across restarts. `credential_hash` is the hex SHA-256 of the
/// bearer secret returned exactly once at registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    /// Dialable QUIC address, `host:port`.
    pub transport_address: String,
    pub pubkey: Vec<u8>,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub declared_capacity_bytes: u64,
    pub used_bytes: u64,
    pub status: PeerStatus,
    pub last_heartbeat_at: Option<u64>,
    pub rolling_uptime_pct: f64,
    pub earned_credits: i64,
    pub created_at: u64,
}

impl Peer {
    /// Bytes still available under the declared capacity.
    pub fn free_bytes(&self) -> u64 {
        self.declared_capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Fraction of declared capacity still free, in `[0, 1]`.
    ///
    /// A peer declaring zero capacity has no free fraction.
    pub fn free_fraction(&self) -> f64 {
        if self.declared_capacity_bytes == 0 {
            return 0.0;
        }
        self.free_bytes() as f64 / self.declared_capacity_bytes as f64
    }

    /// Whether the last heartbeat falls within the liveness window.
    pub fn heartbeat_fresh(&self, now: u64, liveness_window_secs: u64) -> bool {
        match self.last_heartbeat_at {
            Some(at) => now.saturating_sub(at) <= liveness_window_secs,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(capacity: u64, used: u64) -> Peer {
        Peer {
            peer_id: "ab".repeat(32),
            transport_address: "127.0.0.1:4433".to_string(),
            pubkey: vec![0u8; 32],
            credential_hash: String::new(),
            declared_capacity_bytes: capacity,
            used_bytes: used,
            status: PeerStatus::Active,
            last_heartbeat_at: None,
            rolling_uptime_pct: 100.0,
            earned_credits: 0,
            created_at: 0,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [PeerStatus::Active, PeerStatus::Draining, PeerStatus::Dead] {
            let parsed: PeerStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_unknown_rejected() {
        assert!("gone".parse::<PeerStatus>().is_err());
    }

    #[test]
    fn test_free_fraction() {
        assert_eq!(peer(1000, 250).free_fraction(), 0.75);
        assert_eq!(peer(0, 0).free_fraction(), 0.0);
        // Used beyond declared saturates at zero free.
        assert_eq!(peer(100, 200).free_bytes(), 0);
    }

    #[test]
    fn test_heartbeat_fresh() {
        let mut p = peer(1000, 0);
        assert!(!p.heartbeat_fresh(100, 90));
        p.last_heartbeat_at = Some(50);
        assert!(p.heartbeat_fresh(100, 90));
        assert!(!p.heartbeat_fresh(200, 90));
    }

    #[test]
    fn test_credential_hash_not_serialized() {
        let mut p = peer(1, 0);
        p.credential_hash = "secret".to_string();
        let json = serde_json::to_string(&p).expect("serialize");
        assert!(!json.contains("secret"));
    }
}
