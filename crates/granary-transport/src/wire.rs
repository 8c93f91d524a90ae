//! Wire framing for granary peer streams.
//!
//! ## Frame format
//!
//! ```text
//! [length: unsigned LEB128 varint][envelope: CBOR]
//! ```
//!
//! The envelope tags its payload with the protocol identifier string, so a
//! responder can dispatch without negotiating per-stream protocols:
//!
//! ```text
//! Envelope {
//!     protocol: String,   // e.g. "/granary/1.0.0/store-chunk"
//!     payload:  Vec<u8>,  // CBOR-encoded request or response body
//! }
//! ```
//!
//! Reads are incremental: the varint is consumed one byte at a time and the
//! body with `read_exact`, so partial delivery never corrupts a frame. A
//! single message is capped at [`MAX_MESSAGE_BYTES`].

use quinn::{RecvStream, SendStream};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Result, TransportError};

/// Upper bound on a single framed message (16 MiB).
///
/// Chunk ciphertext tops out at a few hundred KiB; the cap exists to stop a
/// malicious length prefix from forcing a huge allocation.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Longest accepted varint encoding. Five LEB128 bytes cover `u32::MAX`,
/// far beyond [`MAX_MESSAGE_BYTES`].
const MAX_VARINT_BYTES: usize = 5;

/// One framed message: a protocol identifier plus its CBOR payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable protocol identifier string.
    pub protocol: String,
    /// CBOR-encoded message body.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope by CBOR-encoding `payload` under `protocol`.
    pub fn new<T: Serialize>(protocol: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            protocol: protocol.to_string(),
            payload: to_cbor(payload)?,
        })
    }

    /// Decode the payload as a typed message.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        from_cbor(&self.payload)
    }
}

/// Serialize a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data).map_err(|e| TransportError::Deserialization(e.to_string()))
}

/// Append the unsigned LEB128 encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// buffer ends mid-varint or the encoding exceeds [`MAX_VARINT_BYTES`].
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode a complete frame (length prefix + envelope) to bytes.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = to_cbor(envelope)?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(TransportError::Protocol(format!(
            "message of {} bytes exceeds maximum {MAX_MESSAGE_BYTES}",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(body.len() + MAX_VARINT_BYTES);
    encode_varint(body.len() as u64, &mut frame);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a complete frame from a buffer; returns the envelope and the
/// total bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(Envelope, usize)> {
    let (len, prefix) = decode_varint(buf)
        .ok_or_else(|| TransportError::Protocol("truncated length prefix".to_string()))?;
    let len = len as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(TransportError::Protocol(format!(
            "declared length {len} exceeds maximum {MAX_MESSAGE_BYTES}"
        )));
    }
    let body = buf
        .get(prefix..prefix + len)
        .ok_or_else(|| TransportError::Protocol("truncated message body".to_string()))?;
    let envelope = from_cbor(body)?;
    Ok((envelope, prefix + len))
}

/// Write one framed envelope to a send stream.
pub async fn send_envelope(stream: &mut SendStream, envelope: &Envelope) -> Result<()> {
    let frame = encode_frame(envelope)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

/// Read one framed envelope from a receive stream.
pub async fn recv_envelope(stream: &mut RecvStream) -> Result<Envelope> {
    let len = read_varint(stream).await? as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(TransportError::Protocol(format!(
            "declared length {len} exceeds maximum {MAX_MESSAGE_BYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    from_cbor(&body)
}

/// Read an unsigned LEB128 varint from a stream, one byte at a time.
async fn read_varint(stream: &mut RecvStream) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        value |= u64::from(byte[0] & 0x7F) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(TransportError::Protocol(
        "length prefix varint too long".to_string(),
    ))
}
