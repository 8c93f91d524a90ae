//! # granary-proof
//!
//! The canonical proof-of-storage computation, shared by the coordinator's
//! verifier and the storage peer's responder so the two sides can never
//! diverge.
//!
//! ## Computation
//!
//! ```text
//! data ← seed ∥ ciphertext
//! repeat difficulty times: data ← SHA-256(data)
//! proof_hash ← lowercase-hex(data)
//! ```
//!
//! The initial concatenation makes the answer depend on every byte of the
//! ciphertext: a peer that no longer holds the chunk cannot produce it, and
//! the hash chain forces `difficulty` sequential SHA-256 rounds so the
//! answer also costs a predictable amount of compute.

use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of a challenge seed in bytes.
pub const SEED_LEN: usize = 32;

/// A computed proof together with how long it took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    /// 64 lowercase hex chars.
    pub proof_hash: String,
    pub duration_ms: u64,
}

/// Generate a fresh 32-byte challenge seed from the OS entropy source.
pub fn generate_seed() -> [u8; SEED_LEN] {
    let mut seed = [0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Compute the canonical proof hash for `(seed, ciphertext, difficulty)`.
///
/// A zero-difficulty challenge still hashes once, so the result is always
/// the hex of a 32-byte digest: `difficulty = 0` yields
/// `hex(SHA-256(seed ∥ ciphertext))`.
pub fn compute(seed: &[u8; SEED_LEN], ciphertext: &[u8], difficulty: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(ciphertext);
    let mut data = hasher.finalize();

    for _ in 1..difficulty {
        data = Sha256::digest(data);
    }

    hex::encode(data)
}

/// Compute the canonical proof and measure elapsed wall-clock time.
pub fn prove(seed: &[u8; SEED_LEN], ciphertext: &[u8], difficulty: u32) -> Proof {
    let start = Instant::now();
    let proof_hash = compute(seed, ciphertext, difficulty);
    Proof {
        proof_hash,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
