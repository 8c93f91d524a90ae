//! Proof-of-storage challenges.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseStatusError;

/// Outcome state of a challenge. `Pending → Verified | Failed`, terminal
/// once written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    Pending,
    Verified,
    Failed,
}

impl ChallengeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeState::Pending => "pending",
            ChallengeState::Verified => "verified",
            ChallengeState::Failed => "failed",
        }
    }
}

impl FromStr for ChallengeState {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChallengeState::Pending),
            "verified" => Ok(ChallengeState::Verified),
            "failed" => Ok(ChallengeState::Failed),
            other => Err(ParseStatusError {
                kind: "challenge state",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a challenge failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// Peer answered too slowly or the stream deadline lapsed.
    Timeout,
    /// Proof hash differed from the canonical recomputation.
    Mismatch,
    /// The stream could not be opened or broke mid-exchange.
    Transport,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Mismatch => "mismatch",
            FailureReason::Transport => "transport",
        }
    }
}

impl FromStr for FailureReason {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureReason::Timeout),
            "mismatch" => Ok(FailureReason::Mismatch),
            "transport" => Ok(FailureReason::Transport),
            other => Err(ParseStatusError {
                kind: "failure reason",
                value: other.to_string(),
            }),
        }
    }
}

/// A single issued challenge and its outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofChallenge {
    pub challenge_id: Uuid,
    pub chunk_id: Uuid,
    pub peer_id: String,
    /// 32 random bytes from a cryptographic source.
    pub seed: [u8; 32],
    pub difficulty: u32,
    pub issued_at: u64,
    pub state: ChallengeState,
    /// 64 lowercase hex chars once a response arrived.
    pub proof_hash: Option<String>,
    pub duration_ms: Option<u64>,
    pub failure_reason: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ChallengeState::Pending,
            ChallengeState::Verified,
            ChallengeState::Failed,
        ] {
            let parsed: ChallengeState = state.as_str().parse().expect("parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_failure_reason_round_trip() {
        for reason in [
            FailureReason::Timeout,
            FailureReason::Mismatch,
            FailureReason::Transport,
        ] {
            let parsed: FailureReason = reason.as_str().parse().expect("parse");
            assert_eq!(parsed, reason);
        }
    }
}
