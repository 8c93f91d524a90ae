//! # granary-node
//!
//! The storage peer daemon: a QUIC responder serving the four peer
//! protocols over the local chunk store, a proof engine that answers
//! challenges from on-disk bytes, and an HTTP client for the coordinator's
//! registration and heartbeat channel.

pub mod client;
pub mod config;
pub mod engine;
pub mod heartbeat;
pub mod identity;
pub mod responder;

/// Error types for node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] granary_chunkstore::ChunkStoreError),

    #[error(transparent)]
    Transport(#[from] granary_transport::TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
