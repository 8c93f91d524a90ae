//! Economics evaluation: roll storage, uptime, and proof outcomes into
//! daily per-peer credits.
//!
//! Runs once per UTC day. For each peer it snapshots the ciphertext bytes
//! of its `active` assignments, derives uptime from the day's heartbeat
//! counter, derives proof success from the day's challenge outcomes, and
//! writes an idempotent `(peer_id, day)` ledger row whose insert credits
//! the peer's balance in the same transaction. Re-running a day is a no-op.

use std::collections::HashMap;

use rusqlite::Connection;
use tokio::sync::broadcast;

use granary_db::queries::{assignments, earnings, peers, proofs};
use granary_types::clock::{day_of, now_secs, seconds_until_next_day, SECS_PER_DAY};
use granary_types::{PeerEarnings, BYTES_PER_GIB};

use crate::{Db, Result};

/// Below this uptime or proof-success percentage, penalties accrue.
const PENALTY_THRESHOLD_PCT: f64 = 95.0;

/// Days blended into the rolling uptime figure on the peer row.
const UPTIME_BLEND_DAYS: f64 = 7.0;

/// Economics tunables.
#[derive(Clone, Copy, Debug)]
pub struct EconomicsConfig {
    /// Credits per GiB-month of stored ciphertext.
    pub storage_credit_per_gib_month: u64,
    /// Expected heartbeat period, for the uptime denominator.
    pub heartbeat_period_secs: u64,
}

/// Summary of one evaluated day.
#[derive(Clone, Copy, Debug, Default)]
pub struct DayReport {
    pub day: u64,
    /// Peers evaluated.
    pub evaluated: usize,
    /// Ledger rows that actually landed (idempotent re-runs land none).
    pub credited: usize,
}

/// Compute one peer's earnings row from the day's raw counters.
pub fn compute_earnings(
    peer_id: &str,
    day: u64,
    storage_bytes: u64,
    heartbeats: u64,
    proofs_verified: u64,
    proofs_total: u64,
    config: &EconomicsConfig,
) -> PeerEarnings {
    let gross_credits = (u128::from(storage_bytes) * u128::from(config.storage_credit_per_gib_month)
        / (u128::from(BYTES_PER_GIB) * 30)) as i64;

    let expected_heartbeats = SECS_PER_DAY / config.heartbeat_period_secs.max(1);
    let uptime_pct = (100.0 * heartbeats as f64 / expected_heartbeats as f64).min(100.0);
    let uptime_penalty = penalty(gross_credits, uptime_pct);

    let proof_pct = if proofs_total == 0 {
        100.0
    } else {
        100.0 * proofs_verified as f64 / proofs_total as f64
    };
    let proof_penalty = penalty(gross_credits, proof_pct);

    let net_credits = (gross_credits - uptime_penalty - proof_penalty).max(0);

    PeerEarnings {
        peer_id: peer_id.to_string(),
        day,
        storage_bytes,
        gross_credits,
        uptime_penalty,
        proof_penalty,
        net_credits,
    }
}

/// Penalty shape shared by uptime and proof success: below the threshold,
/// each missing percentage point costs one percent of gross.
fn penalty(gross_credits: i64, pct: f64) -> i64 {
    if pct >= PENALTY_THRESHOLD_PCT {
        return 0;
    }
    ((gross_credits as f64) * (PENALTY_THRESHOLD_PCT - pct) / 100.0).floor() as i64
}

/// Evaluate one epoch-day for every registered peer.
pub fn evaluate_day(conn: &mut Connection, day: u64, config: &EconomicsConfig) -> Result<DayReport> {
    let storage: HashMap<String, u64> = assignments::active_storage_by_peer(conn)?
        .into_iter()
        .collect();

    let mut report = DayReport {
        day,
        ..DayReport::default()
    };

    for peer in peers::list(conn)? {
        let storage_bytes = storage.get(&peer.peer_id).copied().unwrap_or(0);
        let heartbeats = peers::heartbeat_count(conn, &peer.peer_id, day)?;
        let (verified, total) = proofs::day_stats(conn, &peer.peer_id, day)?;

        let row = compute_earnings(
            &peer.peer_id,
            day,
            storage_bytes,
            heartbeats,
            verified,
            total,
            config,
        );

        report.evaluated += 1;
        if earnings::record(conn, &row)? {
            report.credited += 1;

            let expected = SECS_PER_DAY / config.heartbeat_period_secs.max(1);
            let today_pct = (100.0 * heartbeats as f64 / expected as f64).min(100.0);
            let blended = (peer.rolling_uptime_pct * (UPTIME_BLEND_DAYS - 1.0) + today_pct)
                / UPTIME_BLEND_DAYS;
            peers::set_rolling_uptime(conn, &peer.peer_id, blended)?;
        }
    }

    Ok(report)
}

/// The economics evaluator loop: settles the previous day at startup, then
/// wakes at each UTC day boundary.
pub struct EconomicsEvaluator {
    db: Db,
    config: EconomicsConfig,
}

impl EconomicsEvaluator {
    pub fn new(db: Db, config: EconomicsConfig) -> Self {
        Self { db, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let yesterday = day_of(now_secs()).saturating_sub(1);
            match self.settle(yesterday).await {
                Ok(report) if report.credited > 0 => {
                    tracing::info!(
                        day = report.day,
                        evaluated = report.evaluated,
                        credited = report.credited,
                        "earnings settled"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "earnings settlement failed"),
            }

            let sleep = seconds_until_next_day(now_secs());
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep)) => {}
                _ = shutdown.recv() => {
                    tracing::info!("economics evaluator shutting down");
                    return;
                }
            }
        }
    }

    async fn settle(&self, day: u64) -> Result<DayReport> {
        let mut conn = self.db.lock().await;
        evaluate_day(&mut conn, day, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_types::clock::day_start;
    use granary_types::{AssignmentState, ChallengeState, ProofChallenge};
    use uuid::Uuid;

    fn config() -> EconomicsConfig {
        EconomicsConfig {
            storage_credit_per_gib_month: 100,
            heartbeat_period_secs: 30,
        }
    }

    #[test]
    fn test_reference_day() {
        // 10 GiB stored, 90% uptime, perfect proofs, rate 100/GiB-month:
        // gross = floor(10 * 100 / 30) = 33, uptime penalty = floor(33 * 0.05) = 1.
        let heartbeats = (SECS_PER_DAY / 30) * 9 / 10;
        let row = compute_earnings("p1", 19_000, 10 * BYTES_PER_GIB, heartbeats, 5, 5, &config());

        assert_eq!(row.gross_credits, 33);
        assert_eq!(row.uptime_penalty, 1);
        assert_eq!(row.proof_penalty, 0);
        assert_eq!(row.net_credits, 32);
    }

    #[test]
    fn test_full_uptime_no_penalty() {
        let heartbeats = SECS_PER_DAY / 30;
        let row = compute_earnings("p1", 0, BYTES_PER_GIB, heartbeats, 0, 0, &config());
        assert_eq!(row.gross_credits, 3);
        assert_eq!(row.uptime_penalty, 0);
        // No proofs issued counts as perfect.
        assert_eq!(row.proof_penalty, 0);
        assert_eq!(row.net_credits, 3);
    }

    #[test]
    fn test_overreported_heartbeats_cap_at_100() {
        let row = compute_earnings("p1", 0, BYTES_PER_GIB, 10_000_000, 0, 0, &config());
        assert_eq!(row.uptime_penalty, 0);
    }

    #[test]
    fn test_proof_failures_penalize() {
        let heartbeats = SECS_PER_DAY / 30;
        // Half the proofs failed: 45 points below threshold.
        let row = compute_earnings(
            "p1",
            19_000,
            100 * BYTES_PER_GIB,
            heartbeats,
            1,
            2,
            &config(),
        );
        assert_eq!(row.gross_credits, 333);
        assert_eq!(row.proof_penalty, ((333.0 * 45.0) / 100.0) as i64);
        assert_eq!(
            row.net_credits,
            row.gross_credits - row.proof_penalty
        );
    }

    #[test]
    fn test_net_never_negative() {
        // Zero heartbeats and zero storage still floors at zero.
        let row = compute_earnings("p1", 0, BYTES_PER_GIB, 0, 0, 10, &config());
        assert!(row.net_credits >= 0);
    }

    #[test]
    fn test_evaluate_day_idempotent() {
        let mut conn = granary_db::open_memory().expect("open");
        let day = 19_000u64;
        let noon = day_start(day) + SECS_PER_DAY / 2;

        // One peer storing one active chunk, heartbeating at 90%.
        let peer = granary_types::Peer {
            peer_id: "p1".to_string(),
            transport_address: "127.0.0.1:4433".to_string(),
            pubkey: vec![1u8; 32],
            credential_hash: String::new(),
            declared_capacity_bytes: 20 * BYTES_PER_GIB,
            used_bytes: 0,
            status: granary_types::PeerStatus::Active,
            last_heartbeat_at: None,
            rolling_uptime_pct: 100.0,
            earned_credits: 0,
            created_at: 0,
        };
        peers::insert(&conn, &peer).expect("peer");

        let file = granary_types::File {
            file_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            logical_name: "f".to_string(),
            plaintext_size_bytes: 10 * BYTES_PER_GIB,
            chunk_count: 1,
            encryption_key: vec![0u8; 32],
            status: granary_types::FileStatus::Ready,
            created_at: 0,
        };
        granary_db::queries::files::insert(&conn, &file).expect("file");
        let chunk = granary_types::Chunk {
            chunk_id: Uuid::new_v4(),
            file_id: file.file_id,
            chunk_index: 0,
            ciphertext_hash: "00".repeat(32),
            ciphertext_size_bytes: 10 * BYTES_PER_GIB,
            last_verified_at: None,
        };
        granary_db::queries::chunks::insert(&conn, &chunk).expect("chunk");
        let a = Uuid::new_v4();
        assignments::insert_pending(&conn, a, chunk.chunk_id, "p1", noon).expect("assign");
        assignments::set_state(&conn, a, AssignmentState::Active).expect("activate");

        let target = (SECS_PER_DAY / 30) * 9 / 10;
        conn.execute(
            "INSERT INTO peer_heartbeats (peer_id, day, count) VALUES ('p1', ?1, ?2)",
            [day as i64, target as i64],
        )
        .expect("hb");

        // A verified proof on the day.
        let challenge = ProofChallenge {
            challenge_id: Uuid::new_v4(),
            chunk_id: chunk.chunk_id,
            peer_id: "p1".to_string(),
            seed: [0u8; 32],
            difficulty: 1000,
            issued_at: noon,
            state: ChallengeState::Pending,
            proof_hash: None,
            duration_ms: None,
            failure_reason: None,
        };
        proofs::insert_pending(&conn, &challenge).expect("challenge");
        proofs::mark_verified(&conn, challenge.challenge_id, &"a".repeat(64), 50).expect("verify");

        let first = evaluate_day(&mut conn, day, &config()).expect("evaluate");
        assert_eq!(first.credited, 1);

        let row = earnings::get(&conn, "p1", day).expect("get").expect("row");
        assert_eq!(row.gross_credits, 33);
        assert_eq!(row.uptime_penalty, 1);
        assert_eq!(row.net_credits, 32);
        assert_eq!(peers::get(&conn, "p1").expect("peer").earned_credits, 32);

        // Second run of the same day credits nothing.
        let second = evaluate_day(&mut conn, day, &config()).expect("re-evaluate");
        assert_eq!(second.credited, 0);
        assert_eq!(peers::get(&conn, "p1").expect("peer").earned_credits, 32);
    }
}
