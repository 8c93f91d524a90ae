//! Proof scheduling: challenge peers to prove they still hold their chunks.
//!
//! Each cycle selects `(chunk, peer)` pairs whose assignment and peer are
//! both `active` and whose chunk has not been verified within the proof
//! period, then issues a fresh random challenge to each, staggered to avoid
//! a thundering herd. Responses are verified by recomputing the canonical
//! answer over an authoritative copy of the ciphertext and comparing
//! byte-for-byte.
//!
//! Authoritative ciphertext is sourced in trust order: the staging copy,
//! then a *different* active replica (hash-verified), and only as a last
//! resort the challenged peer itself — in which case verification
//! degenerates to a liveness check and says nothing about possession, so a
//! warning is logged every time that path is taken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use granary_db::queries::{chunks, peers, proofs};
use granary_transport::messages::{
    ProofChallengeRequest, ProofChallengeResponse, PROTOCOL_PROOF_CHALLENGE,
};
use granary_transport::quic::{self, QuicNode};
use granary_transport::wire::Envelope;
use granary_types::clock::now_secs;
use granary_types::{ChallengeState, Chunk, FailureReason, ProofChallenge};

use crate::config::StorageOptions;
use crate::{fetch, CoordError, Db, Result};

/// How often the scheduler scans for due pairs.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Challenges issued per scan at most.
const SCAN_LIMIT: u32 = 256;

/// Pause between challenge starts.
const STAGGER: Duration = Duration::from_millis(100);

/// Upper bound on the challenge round trip.
const STREAM_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline when fetching authoritative ciphertext for verification.
const VERIFY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of one challenge cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleReport {
    pub issued: usize,
    pub verified: usize,
    pub failed: usize,
}

/// The proof scheduler.
pub struct ProofScheduler {
    db: Db,
    node: Arc<QuicNode>,
    options: StorageOptions,
}

impl ProofScheduler {
    pub fn new(db: Db, node: Arc<QuicNode>, options: StorageOptions) -> Self {
        Self { db, node, options }
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.challenge_cycle().await {
                        Ok(report) if report.issued > 0 => {
                            tracing::info!(
                                issued = report.issued,
                                verified = report.verified,
                                failed = report.failed,
                                "proof cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "proof cycle failed"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("proof scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Challenge every due `(chunk, peer)` pair once.
    pub async fn challenge_cycle(&self) -> Result<CycleReport> {
        let due = {
            let conn = self.db.lock().await;
            proofs::due_pairs(&conn, now_secs(), self.options.proof_period_secs, SCAN_LIMIT)?
        };

        let mut report = CycleReport::default();
        for (chunk_id, peer_id) in due {
            match self.issue_challenge(chunk_id, &peer_id).await {
                Ok(ChallengeState::Verified) => {
                    report.issued += 1;
                    report.verified += 1;
                }
                Ok(_) => {
                    report.issued += 1;
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(%chunk_id, %peer_id, error = %e, "challenge not issued");
                }
            }
            tokio::time::sleep(STAGGER).await;
        }
        Ok(report)
    }

    /// Issue one challenge and verify the response. Returns the terminal
    /// state written for the challenge.
    pub async fn issue_challenge(&self, chunk_id: Uuid, peer_id: &str) -> Result<ChallengeState> {
        let (chunk, peer) = {
            let conn = self.db.lock().await;
            (chunks::get(&conn, chunk_id)?, peers::get(&conn, peer_id)?)
        };

        let challenge = ProofChallenge {
            challenge_id: Uuid::new_v4(),
            chunk_id,
            peer_id: peer_id.to_string(),
            seed: granary_proof::generate_seed(),
            difficulty: self.options.proof_difficulty,
            issued_at: now_secs(),
            state: ChallengeState::Pending,
            proof_hash: None,
            duration_ms: None,
            failure_reason: None,
        };
        {
            let conn = self.db.lock().await;
            proofs::insert_pending(&conn, &challenge)?;
        }

        let response = self.send_challenge(&challenge, &peer.transport_address).await;

        let conn = self.db.lock().await;
        match response {
            Err(e) if e.is_timeout() => {
                proofs::mark_failed(
                    &conn,
                    challenge.challenge_id,
                    FailureReason::Timeout,
                    None,
                    None,
                )?;
                Ok(ChallengeState::Failed)
            }
            Err(e) => {
                tracing::debug!(%chunk_id, %peer_id, error = %e, "challenge stream failed");
                proofs::mark_failed(
                    &conn,
                    challenge.challenge_id,
                    FailureReason::Transport,
                    None,
                    None,
                )?;
                Ok(ChallengeState::Failed)
            }
            Ok(body) => {
                drop(conn);
                self.verify_response(&challenge, &chunk, body).await
            }
        }
    }

    async fn send_challenge(
        &self,
        challenge: &ProofChallenge,
        transport_address: &str,
    ) -> granary_transport::Result<ProofChallengeResponse> {
        let addr = quic::parse_addr(transport_address)?;
        let connection = self.node.connect(addr).await?;
        let request = Envelope::new(
            PROTOCOL_PROOF_CHALLENGE,
            &ProofChallengeRequest {
                challenge_id: challenge.challenge_id,
                chunk_id: challenge.chunk_id,
                seed: challenge.seed,
                difficulty: challenge.difficulty,
            },
        )?;
        let response = quic::request(&connection, &request, STREAM_DEADLINE).await?;
        response.decode_payload()
    }

    /// Compare a peer's answer against the canonical recomputation.
    async fn verify_response(
        &self,
        challenge: &ProofChallenge,
        chunk: &Chunk,
        body: ProofChallengeResponse,
    ) -> Result<ChallengeState> {
        if body.duration_ms > self.options.proof_deadline_ms {
            let conn = self.db.lock().await;
            proofs::mark_failed(
                &conn,
                challenge.challenge_id,
                FailureReason::Timeout,
                Some(&body.proof_hash),
                Some(body.duration_ms),
            )?;
            return Ok(ChallengeState::Failed);
        }

        let ciphertext = match self.authoritative_ciphertext(chunk, &challenge.peer_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    chunk_id = %chunk.chunk_id,
                    error = %e,
                    "no authoritative ciphertext for verification"
                );
                let conn = self.db.lock().await;
                proofs::mark_failed(
                    &conn,
                    challenge.challenge_id,
                    FailureReason::Transport,
                    Some(&body.proof_hash),
                    Some(body.duration_ms),
                )?;
                return Ok(ChallengeState::Failed);
            }
        };

        let expected =
            granary_proof::compute(&challenge.seed, &ciphertext, challenge.difficulty);

        let conn = self.db.lock().await;
        if body.proof_hash == expected {
            proofs::mark_verified(
                &conn,
                challenge.challenge_id,
                &body.proof_hash,
                body.duration_ms,
            )?;
            chunks::set_last_verified(&conn, chunk.chunk_id, now_secs())?;
            Ok(ChallengeState::Verified)
        } else {
            proofs::mark_failed(
                &conn,
                challenge.challenge_id,
                FailureReason::Mismatch,
                Some(&body.proof_hash),
                Some(body.duration_ms),
            )?;
            Ok(ChallengeState::Failed)
        }
    }

    /// Source ciphertext the verifier can trust: staging, then another
    /// replica, then (degenerately) the challenged peer itself.
    async fn authoritative_ciphertext(&self, chunk: &Chunk, challenged: &str) -> Result<Vec<u8>> {
        {
            let conn = self.db.lock().await;
            if let Some(bytes) = chunks::get_staging(&conn, chunk.chunk_id)? {
                return Ok(bytes);
            }
        }

        match fetch::from_replica(
            &self.db,
            &self.node,
            chunk,
            Some(challenged),
            VERIFY_FETCH_TIMEOUT,
        )
        .await
        {
            Ok(fetched) => return Ok(fetched.bytes),
            Err(CoordError::NoSource(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::warn!(
            chunk_id = %chunk.chunk_id,
            peer_id = %challenged,
            "only the challenged peer can supply the ciphertext; \
             verification degenerates to a liveness check"
        );
        let peer = {
            let conn = self.db.lock().await;
            peers::get(&conn, challenged)?
        };
        fetch::from_peer(&self.node, chunk, &peer, VERIFY_FETCH_TIMEOUT).await
    }
}
