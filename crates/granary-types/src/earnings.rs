//! Daily per-peer earnings rows.

use serde::{Deserialize, Serialize};

/// One peer's ledger entry for one epoch-day. `(peer_id, day)` is unique;
/// summing `net_credits` over a peer's rows equals the total ever added to
/// its `earned_credits`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEarnings {
    pub peer_id: String,
    /// Epoch-day number (Unix seconds / 86 400).
    pub day: u64,
    /// Snapshot of active-assignment ciphertext bytes at evaluation time.
    pub storage_bytes: u64,
    pub gross_credits: i64,
    pub uptime_penalty: i64,
    pub proof_penalty: i64,
    pub net_credits: i64,
}
