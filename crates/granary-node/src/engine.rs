//! Peer-side proof engine.
//!
//! Answers a challenge by reading the chunk's ciphertext from the local
//! store and running the canonical computation over it. A chunk the store
//! does not hold is a hard error: the engine never fabricates an answer.

use std::sync::Arc;

use uuid::Uuid;

use granary_chunkstore::ChunkStore;
use granary_proof::Proof;

use crate::Result;

/// Proof responder over the local chunk store.
pub struct ProofEngine {
    store: Arc<ChunkStore>,
}

impl ProofEngine {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self { store }
    }

    /// Compute the answer to `(chunk_id, seed, difficulty)` from on-disk
    /// bytes, reporting elapsed time.
    pub fn answer(&self, chunk_id: Uuid, seed: &[u8; 32], difficulty: u32) -> Result<Proof> {
        let ciphertext = self.store.get(chunk_id)?;
        Ok(granary_proof::prove(seed, &ciphertext, difficulty))
    }
}
