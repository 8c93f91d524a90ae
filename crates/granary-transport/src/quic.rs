//! QUIC/TLS 1.3 connection management for granary peers.
//!
//! Both roles run the same [`QuicNode`]: the coordinator dials storage peers
//! to push chunks and issue challenges, and storage peers listen for those
//! streams. Nodes present self-signed TLS certificates; TLS here provides
//! transport encryption only, while peer identity is established at the
//! application layer (content-addressed peer ids verified at registration).
//!
//! ## ALPN
//!
//! The ALPN protocol identifier is `granary/1`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::messages::{ErrorResponse, PROTOCOL_ERROR};
use crate::wire::{self, Envelope};
use crate::{Result, TransportError};

/// ALPN protocol identifier for granary protocol version 1.
pub const ALPN_GRANARY_V1: &[u8] = b"granary/1";

/// TLS SNI name used when dialing; self-signed certificates are not
/// verified, so the value only needs to be a well-formed hostname.
pub const SERVER_NAME: &str = "granary-peer";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams per connection.
pub const DEFAULT_MAX_BI_STREAMS: u32 = 64;

/// Configuration for a QUIC node.
#[derive(Clone)]
pub struct QuicConfig {
    /// Local address to bind to. Port 0 asks the OS for an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// A QUIC endpoint able to both listen for and initiate peer streams.
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicNode {
    /// Bind a node to the configured address, generating a self-signed
    /// certificate for the server side.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails and
    /// [`TransportError::Io`] if the socket cannot be bound.
    pub fn bind(config: QuicConfig) -> Result<Self> {
        let (server_config, client_config) = endpoint_configs(&config)?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::info!(%local_addr, "QUIC node listening");

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    /// The local socket address this node is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming QUIC connection.
    ///
    /// Returns `None` once the endpoint has been closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Dial a peer at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the connection cannot be
    /// established.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::debug!(remote = %connection.remote_address(), "QUIC connection established");
        Ok(connection)
    }

    /// Accept the next bidirectional stream on an existing connection.
    pub async fn accept_bi(connection: &Connection) -> Result<(SendStream, RecvStream)> {
        connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Close the endpoint; all connections terminate with the given code.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.endpoint
            .close(quinn::VarInt::from_u32(error_code), reason);
    }
}

/// Send one request envelope on a fresh stream of `connection` and await
/// the single response envelope, all under `deadline`.
///
/// An error envelope from the remote surfaces as
/// [`TransportError::Remote`]; a lapsed deadline as
/// [`TransportError::Timeout`].
pub async fn request(
    connection: &Connection,
    envelope: &Envelope,
    deadline: Duration,
) -> Result<Envelope> {
    let exchange = async {
        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        wire::send_envelope(&mut send, envelope).await?;
        send.finish()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        wire::recv_envelope(&mut recv).await
    };

    let response = tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| TransportError::Timeout(deadline.as_millis() as u64))??;

    if response.protocol == PROTOCOL_ERROR {
        let err: ErrorResponse = response.decode_payload()?;
        return Err(TransportError::Remote(err.error));
    }
    Ok(response)
}

/// Parse a peer's dialable `host:port` transport address.
pub fn parse_addr(address: &str) -> Result<SocketAddr> {
    address
        .parse()
        .map_err(|_| TransportError::Connection(format!("undialable address: {address}")))
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Build both halves of the endpoint configuration in one pass.
///
/// Server and client share a single crypto provider, the granary ALPN, and
/// one transport profile (idle timeout, stream bound) — a node dials with
/// the same limits it serves under. The server presents a throwaway
/// self-signed Ed25519 certificate minted here; the client accepts any
/// certificate, because peer identity lives at the application layer.
fn endpoint_configs(config: &QuicConfig) -> Result<(ServerConfig, ClientConfig)> {
    let transport = Arc::new(transport_profile(config)?);
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    // Throwaway server identity, regenerated at every bind.
    let endpoint_key =
        rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(tls("generate endpoint key"))?;
    let certificate = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(tls("certificate parameters"))?
        .self_signed(&endpoint_key)
        .map_err(tls("self-sign certificate"))?;
    let cert_der = CertificateDer::from(certificate.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(endpoint_key.serialize_der()));

    let mut server_tls = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls("server protocol versions"))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(tls("install endpoint certificate"))?;
    server_tls.alpn_protocols = vec![ALPN_GRANARY_V1.to_vec()];

    let mut client_tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls("client protocol versions"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
        .with_no_client_auth();
    client_tls.alpn_protocols = vec![ALPN_GRANARY_V1.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_tls)
            .map_err(tls("server crypto"))?,
    ));
    server_config.transport_config(transport.clone());

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_tls)
            .map_err(tls("client crypto"))?,
    ));
    client_config.transport_config(transport);

    Ok((server_config, client_config))
}

/// The transport profile shared by dialing and serving.
fn transport_profile(config: &QuicConfig) -> Result<quinn::TransportConfig> {
    let idle = Duration::from_millis(u64::from(config.idle_timeout_ms));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(idle).map_err(tls("idle timeout"))?,
    ));
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(config.max_bi_streams));
    Ok(transport)
}

/// Tag a TLS-setup failure with the stage it happened in.
fn tls<E: std::fmt::Display>(stage: &'static str) -> impl FnOnce(E) -> TransportError {
    move |e| TransportError::Tls(format!("{stage}: {e}"))
}

/// Accepts any server certificate. Peers are self-signed; possession of a
/// registered chunk store is proven at the application layer, not by TLS.
/// Supported signature schemes are taken from the crypto provider rather
/// than hard-coded.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<rustls::SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new(provider: &rustls::crypto::CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_value() {
        assert_eq!(ALPN_GRANARY_V1, b"granary/1");
    }

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.max_bi_streams, DEFAULT_MAX_BI_STREAMS);
        assert_eq!(config.bind_addr.port(), 0);
    }

    #[test]
    fn test_parse_addr() {
        assert!(parse_addr("127.0.0.1:4433").is_ok());
        assert!(parse_addr("not an address").is_err());
    }

    #[test]
    fn test_endpoint_configs_succeed() {
        assert!(endpoint_configs(&QuicConfig::default()).is_ok());
    }

    #[test]
    fn test_transport_profile_respects_config() {
        let config = QuicConfig {
            idle_timeout_ms: 5_000,
            max_bi_streams: 7,
            ..QuicConfig::default()
        };
        assert!(transport_profile(&config).is_ok());
    }

    #[test]
    fn test_tls_error_carries_stage() {
        let err = tls("self-sign certificate")(std::fmt::Error);
        assert!(err.to_string().contains("self-sign certificate"));
    }

    #[test]
    fn test_verifier_schemes_come_from_provider() {
        let provider = rustls::crypto::ring::default_provider();
        let verifier = AcceptAnyServerCert::new(&provider);
        assert!(!verifier.schemes.is_empty());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let node = QuicNode::bind(QuicConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..QuicConfig::default()
        })
        .expect("bind");
        assert_ne!(node.local_addr().port(), 0);
        node.close(0, b"done");
    }
}
