//! QUIC responder: serve the four peer protocols over the local store.
//!
//! Each inbound bidirectional stream carries one request envelope; the
//! handler dispatches on the envelope's protocol string, runs the store or
//! engine operation, and writes one response envelope back. Requests the
//! handler cannot answer in kind (a proof for a chunk the store lacks, an
//! unknown protocol) get an error envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use granary_chunkstore::{ChunkStore, ChunkStoreError};
use granary_transport::messages::{
    DeleteChunkRequest, DeleteChunkResponse, ErrorResponse, ProofChallengeRequest,
    ProofChallengeResponse, RetrieveChunkRequest, RetrieveChunkResponse, StoreChunkRequest,
    StoreChunkResponse, PROTOCOL_DELETE_CHUNK, PROTOCOL_ERROR, PROTOCOL_PROOF_CHALLENGE,
    PROTOCOL_RETRIEVE_CHUNK, PROTOCOL_STORE_CHUNK,
};
use granary_transport::quic::QuicNode;
use granary_transport::wire::{self, Envelope};
use granary_types::clock::now_secs;

use crate::engine::ProofEngine;
use crate::Result;

/// The storage peer's protocol responder.
pub struct Responder {
    node: Arc<QuicNode>,
    store: Arc<ChunkStore>,
    engine: ProofEngine,
    /// While set, store requests are refused; everything else still works.
    draining: Arc<AtomicBool>,
}

impl Responder {
    pub fn new(node: Arc<QuicNode>, store: Arc<ChunkStore>, draining: Arc<AtomicBool>) -> Self {
        let engine = ProofEngine::new(store.clone());
        Self {
            node,
            store,
            engine,
            draining,
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let responder = Arc::new(self);
        loop {
            tokio::select! {
                incoming = responder.node.accept() => {
                    let Some(incoming) = incoming else {
                        tracing::info!("transport closed, responder exiting");
                        return;
                    };
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(connection) => responder.serve_connection(connection).await,
                            Err(e) => tracing::debug!(error = %e, "handshake failed"),
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("responder shutting down");
                    return;
                }
            }
        }
    }

    /// Serve every stream of one connection.
    async fn serve_connection(self: Arc<Self>, connection: quinn::Connection) {
        let remote = connection.remote_address();
        loop {
            match QuicNode::accept_bi(&connection).await {
                Ok((send, recv)) => {
                    let responder = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = responder.serve_stream(send, recv).await {
                            tracing::debug!(%remote, error = %e, "stream failed");
                        }
                    });
                }
                Err(_) => return,
            }
        }
    }

    /// One request, one response.
    async fn serve_stream(
        &self,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<()> {
        let request = wire::recv_envelope(&mut recv).await?;
        let response = self.dispatch(&request);
        wire::send_envelope(&mut send, &response).await?;
        send.finish()
            .map_err(|e| granary_transport::TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Tagged dispatch on the protocol identifier.
    fn dispatch(&self, request: &Envelope) -> Envelope {
        let result = match request.protocol.as_str() {
            PROTOCOL_STORE_CHUNK => self.handle_store(request),
            PROTOCOL_RETRIEVE_CHUNK => self.handle_retrieve(request),
            PROTOCOL_DELETE_CHUNK => self.handle_delete(request),
            PROTOCOL_PROOF_CHALLENGE => self.handle_proof(request),
            other => Err(format!("unknown protocol: {other}")),
        };
        result.unwrap_or_else(|error| error_envelope(&error))
    }

    fn handle_store(&self, request: &Envelope) -> std::result::Result<Envelope, String> {
        let body: StoreChunkRequest = request.decode_payload().map_err(|e| e.to_string())?;

        if self.draining.load(Ordering::Relaxed) {
            let reply = StoreChunkResponse {
                success: false,
                error: Some("draining: not accepting new chunks".to_string()),
            };
            return Envelope::new(PROTOCOL_STORE_CHUNK, &reply).map_err(|e| e.to_string());
        }

        let stored = self.store.put(
            body.chunk_id,
            body.file_id,
            body.chunk_index,
            &body.ciphertext_hash,
            &body.bytes,
            now_secs(),
        );
        let reply = match stored {
            Ok(()) => StoreChunkResponse {
                success: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!(chunk_id = %body.chunk_id, error = %e, "store refused");
                StoreChunkResponse {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };
        Envelope::new(PROTOCOL_STORE_CHUNK, &reply).map_err(|e| e.to_string())
    }

    fn handle_retrieve(&self, request: &Envelope) -> std::result::Result<Envelope, String> {
        let body: RetrieveChunkRequest = request.decode_payload().map_err(|e| e.to_string())?;

        let reply = match self.store.get(body.chunk_id) {
            Ok(bytes) => {
                let meta = self.store.meta(body.chunk_id).map_err(|e| e.to_string())?;
                RetrieveChunkResponse {
                    found: true,
                    bytes,
                    ciphertext_hash: meta.ciphertext_hash,
                }
            }
            Err(ChunkStoreError::NotFound(_)) => RetrieveChunkResponse {
                found: false,
                bytes: Vec::new(),
                ciphertext_hash: String::new(),
            },
            Err(e) => return Err(e.to_string()),
        };
        Envelope::new(PROTOCOL_RETRIEVE_CHUNK, &reply).map_err(|e| e.to_string())
    }

    fn handle_delete(&self, request: &Envelope) -> std::result::Result<Envelope, String> {
        let body: DeleteChunkRequest = request.decode_payload().map_err(|e| e.to_string())?;
        self.store.delete(body.chunk_id).map_err(|e| e.to_string())?;
        Envelope::new(PROTOCOL_DELETE_CHUNK, &DeleteChunkResponse { success: true })
            .map_err(|e| e.to_string())
    }

    fn handle_proof(&self, request: &Envelope) -> std::result::Result<Envelope, String> {
        let body: ProofChallengeRequest = request.decode_payload().map_err(|e| e.to_string())?;

        // A missing chunk must surface as an error, never a made-up proof.
        let proof = self
            .engine
            .answer(body.chunk_id, &body.seed, body.difficulty)
            .map_err(|e| e.to_string())?;

        Envelope::new(
            PROTOCOL_PROOF_CHALLENGE,
            &ProofChallengeResponse {
                challenge_id: body.challenge_id,
                proof_hash: proof.proof_hash,
                duration_ms: proof.duration_ms,
            },
        )
        .map_err(|e| e.to_string())
    }
}

fn error_envelope(error: &str) -> Envelope {
    Envelope::new(
        PROTOCOL_ERROR,
        &ErrorResponse {
            error: error.to_string(),
        },
    )
    .unwrap_or_else(|_| Envelope {
        protocol: PROTOCOL_ERROR.to_string(),
        payload: Vec::new(),
    })
}
