//! Pinned TLS connector.
//!
//! # How the consumer trusts the holder (for beginners)
//!
//! Browsers trust a server because a certificate authority vouches for its
//! name.  A holder on a home network has no such certificate; it presents a
//! self-signed one.  Instead of a CA the consumer trusts exactly one
//! certificate: the one whose SHA-256 [`Fingerprint`] was carried in the
//! credential bundle the operator showed.
//!
//! The connector therefore:
//!
//! 1. opens the TCP connection (bounded by a timeout),
//! 2. runs a normal TLS handshake in which the handshake signatures are still
//!    verified against the presented certificate, so the peer must hold its
//!    private key,
//! 3. hashes the presented end-entity certificate and compares it with the
//!    pinned fingerprint **before any request is written**.
//!
//! A mismatch drops the connection and surfaces as
//! [`ConnectError::FingerprintMismatch`]; the holder never sees a single byte
//! of application data.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lansync_core::wire::{encode_request, parse_response, Parse};
use lansync_core::{Fingerprint, WireRequest, WireResponse};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::application::sync_client::{Transport, TransportError};

/// Default bound on TCP connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// Error type for connection establishment.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The TLS client configuration could not be built.
    #[error("TLS setup failed: {0}")]
    Setup(#[from] rustls::Error),

    /// The host is neither an IP address nor a valid DNS name.
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    /// TCP connect failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TLS handshake failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connect and handshake did not finish in time.
    #[error("timed out connecting to {0}")]
    TimedOut(String),

    /// The peer presented no certificate.
    #[error("holder presented no certificate")]
    NoCertificate,

    /// The peer's certificate is not the pinned one.
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },
}

/// Accepts any certificate chain but verifies handshake signatures.
///
/// Chain trust is replaced by the explicit pin check in
/// [`PinnedConnector::connect`].
#[derive(Debug)]
struct PinnedCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Opens TLS connections to one pinned holder certificate.
#[derive(Clone)]
pub struct PinnedConnector {
    connector: TlsConnector,
    fingerprint: Fingerprint,
    connect_timeout: Duration,
}

impl PinnedConnector {
    /// # Errors
    ///
    /// Returns [`ConnectError::Setup`] if the TLS configuration is rejected.
    pub fn new(fingerprint: Fingerprint, connect_timeout: Duration) -> Result<Self, ConnectError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { provider }))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            fingerprint,
            connect_timeout,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Connects, completes the handshake, and checks the pin.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::FingerprintMismatch`] when the holder presents
    /// a different certificate, and the other [`ConnectError`] variants for
    /// network and handshake failures.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>, ConnectError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addr = display_addr(host, port);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ConnectError::InvalidHost(host.to_string()))?;

        let stream = timeout(self.connect_timeout, async {
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|source| ConnectError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            self.connector
                .connect(server_name, tcp)
                .await
                .map_err(|source| ConnectError::Handshake {
                    addr: addr.clone(),
                    source,
                })
        })
        .await
        .map_err(|_| ConnectError::TimedOut(addr.clone()))??;

        let presented = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or(ConnectError::NoCertificate)?;
        if !self.fingerprint.matches_der(presented.as_ref()) {
            let actual = Fingerprint::of_der(presented.as_ref());
            warn!(
                "{addr} presented certificate {actual}, expected {}",
                self.fingerprint
            );
            return Err(ConnectError::FingerprintMismatch {
                expected: self.fingerprint,
                actual,
            });
        }

        debug!("connected to {addr}");
        Ok(stream)
    }
}

impl From<ConnectError> for TransportError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::FingerprintMismatch { expected, actual } => {
                TransportError::FingerprintMismatch { expected, actual }
            }
            other => TransportError::Connect(Box::new(other)),
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One request per pinned TLS connection.
#[derive(Clone)]
pub struct TlsTransport {
    connector: PinnedConnector,
    io_timeout: Duration,
}

impl TlsTransport {
    /// # Errors
    ///
    /// Returns [`ConnectError::Setup`] if the TLS configuration is rejected.
    pub fn new(
        fingerprint: Fingerprint,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        Ok(Self {
            connector: PinnedConnector::new(fingerprint, connect_timeout)?,
            io_timeout,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        request: &WireRequest,
    ) -> Result<WireResponse, TransportError> {
        // Nothing is written until the pin has been checked.
        let mut stream = self.connector.connect(host, port).await?;
        let bytes = encode_request(request);

        timeout(self.io_timeout, async {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
            let response = read_response(&mut stream).await?;
            // The holder closes after one response; a failed close_notify is
            // not worth surfacing.
            let _ = stream.shutdown().await;
            Ok::<_, TransportError>(response)
        })
        .await
        .map_err(|_| TransportError::TimedOut)?
    }
}

/// Reads one response frame, treating a close without `close_notify` like a
/// clean end of stream.
///
/// # Errors
///
/// Returns [`TransportError::Wire`] for malformed frames and
/// [`TransportError::Io`] if the stream ends before the frame is complete.
pub async fn read_response<R>(reader: &mut R) -> Result<WireResponse, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Parse::Complete { value, .. } = parse_response(&buf, false)? {
            return Ok(value);
        }
        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return match parse_response(&buf, true)? {
                Parse::Complete { value, .. } => Ok(value),
                Parse::Incomplete => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before the response was complete",
                ))),
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn display_addr(host: &str, port: u16) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
