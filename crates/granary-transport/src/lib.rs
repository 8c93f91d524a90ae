//! # granary-transport
//!
//! The peer-to-peer stream transport of the granary network:
//!
//! - **QUIC/TLS 1.3** connection management via [`quic`]
//! - **Wire framing** (varint length prefix + CBOR envelope) via [`wire`]
//! - **Typed messages** for the four peer protocols via [`messages`]
//!
//! Every request travels on its own bidirectional stream: the caller opens
//! the stream, writes one framed envelope, finishes the send side, and
//! awaits one framed envelope in response.

pub mod messages;
pub mod quic;
pub mod wire;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Framing violation (oversized message, malformed length prefix).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A deadline elapsed before the peer answered.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// QUIC connection could not be established or broke.
    #[error("connection error: {0}")]
    Connection(String),

    /// Stream read/write failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The remote answered with an error envelope instead of a response.
    #[error("remote error: {0}")]
    Remote(String),
}

impl TransportError {
    /// Whether this failure is a deadline expiry rather than a broken stream.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
