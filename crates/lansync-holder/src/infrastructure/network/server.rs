//! TransportServer: the TLS listener that serves the holder's endpoints.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept TCP ──► TLS handshake ──► read one request ──► route ──► write response ──► close
//!                (handshake        (idle timeout,
//!                 timeout)          size limits)
//! ```
//!
//! Each connection carries exactly one request.  A malformed or oversized
//! request is answered with 400; a peer that disconnects, stalls, or fails
//! the handshake is dropped without a response.  Writing the response and
//! closing the stream are bounded by the same `read_timeout`.
//!
//! # State and bookkeeping
//!
//! The server moves through [`ServerState`]:
//!
//! ```text
//! Stopped ──start()──► Starting ──► Running { port }
//!                          └──────► Failed(reason)
//! any state ──stop()──► Stopped
//! ```
//!
//! A single `tokio::sync::Mutex` guards the listener task handle and the
//! table of open connections.  Every connection task is inserted into that
//! table while the accept loop holds the lock, and removes itself (again
//! under the lock) when it finishes, so [`TransportServer::stop`] always sees
//! a complete table and can abort every connection it contains.
//!
//! State changes are published on a `tokio::sync::watch` channel so a UI can
//! follow them without polling.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lansync_core::wire::{encode_response, parse_request, Parse, WireError};
use lansync_core::{Fingerprint, StatusCode, WireRequest, WireResponse};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::application::router::Router;
use crate::infrastructure::identity::{IdentityError, IdentityProvider};
use crate::infrastructure::network::advertiser::{ServiceAdvertisement, ServiceAdvertiser};

const READ_CHUNK: usize = 8 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Public types ──────────────────────────────────────────────────────────────

/// Observable lifecycle state of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running { port: u16 },
    Failed(String),
}

/// Error type for server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start()` was called while the server was not stopped.
    #[error("server is not stopped (current state: {0:?})")]
    NotStopped(ServerState),

    /// The TLS identity could not be obtained.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The identity could not be turned into a TLS configuration.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Error produced while reading a request from a connection.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for request data")]
    TimedOut,
}

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub bind_address: IpAddr,
    /// `0` lets the OS choose a free port.
    pub port: u16,
    /// Name published in the service advertisement.
    pub service_name: String,
    pub handshake_timeout: Duration,
    /// Longest silence tolerated while a request is being received.
    pub read_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            service_name: "LanSync Holder".to_string(),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Coordinator {
    listener: Option<JoinHandle<()>>,
    connections: HashMap<u64, AbortHandle>,
    fingerprint: Option<Fingerprint>,
}

struct Shared {
    settings: TransportSettings,
    router: Arc<Router>,
    coordinator: Mutex<Coordinator>,
    state_tx: watch::Sender<ServerState>,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        self.state_tx.send_replace(state);
    }
}

/// TLS request/response server.
pub struct TransportServer {
    shared: Arc<Shared>,
    identity: Arc<dyn IdentityProvider>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
}

impl TransportServer {
    pub fn new(
        settings: TransportSettings,
        identity: Arc<dyn IdentityProvider>,
        router: Arc<Router>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        Self {
            shared: Arc::new(Shared {
                settings,
                router,
                coordinator: Mutex::new(Coordinator::default()),
                state_tx,
                next_connection_id: AtomicU64::new(0),
            }),
            identity,
            advertiser: None,
        }
    }

    /// Publishes the service through `advertiser` whenever the server runs.
    pub fn with_advertiser(mut self, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    pub fn state(&self) -> ServerState {
        self.shared.state_tx.borrow().clone()
    }

    /// Receives every subsequent state change.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.shared.state_tx.subscribe()
    }

    /// Port the server listens on while running.
    pub fn port(&self) -> Option<u16> {
        match self.state() {
            ServerState::Running { port } => Some(port),
            _ => None,
        }
    }

    /// Fingerprint of the certificate presented while running.
    pub async fn fingerprint(&self) -> Option<Fingerprint> {
        self.shared.coordinator.lock().await.fingerprint
    }

    /// Number of connections currently being served.
    pub async fn active_connections(&self) -> usize {
        self.shared.coordinator.lock().await.connections.len()
    }

    /// Starts listening and returns the bound port.
    ///
    /// Calling `start` on a running server returns its port.  Startup
    /// failures leave the server in [`ServerState::Failed`]; call
    /// [`TransportServer::stop`] before trying again.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotStopped`] when starting or failed, and the
    /// underlying error when the identity, TLS setup, or bind fails.
    pub async fn start(&self) -> Result<u16, ServerError> {
        let mut coord = self.shared.coordinator.lock().await;
        match self.state() {
            ServerState::Stopped => {}
            ServerState::Running { port } => return Ok(port),
            other => return Err(ServerError::NotStopped(other)),
        }
        self.shared.set_state(ServerState::Starting);

        let (listener, port, acceptor, fingerprint) = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("transport server failed to start: {e}");
                self.shared.set_state(ServerState::Failed(e.to_string()));
                return Err(e);
            }
        };

        coord.listener = Some(tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            acceptor,
        )));
        coord.fingerprint = Some(fingerprint);
        self.shared.set_state(ServerState::Running { port });
        info!(
            "transport server listening on {}:{port} ({fingerprint})",
            self.shared.settings.bind_address
        );

        if let Some(advertiser) = &self.advertiser {
            let ad = ServiceAdvertisement {
                name: self.shared.settings.service_name.clone(),
                port,
            };
            if let Err(e) = advertiser.publish(ad).await {
                warn!("server running but not advertised: {e}");
            }
        }
        Ok(port)
    }

    /// Withdraws the advertisement, closes the listener, and aborts every open
    /// connection.  Valid from any state.
    pub async fn stop(&self) {
        let mut coord = self.shared.coordinator.lock().await;
        if let Some(advertiser) = &self.advertiser {
            advertiser.withdraw().await;
        }
        if let Some(listener) = coord.listener.take() {
            listener.abort();
        }
        let open = coord.connections.len();
        for (_, connection) in coord.connections.drain() {
            connection.abort();
        }
        coord.fingerprint = None;
        self.shared.set_state(ServerState::Stopped);
        info!("transport server stopped, aborted {open} connection(s)");
    }

    async fn prepare(&self) -> Result<(TcpListener, u16, TlsAcceptor, Fingerprint), ServerError> {
        let settings = &self.shared.settings;
        let identity = self.identity.identity()?;

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![identity.certificate()], identity.private_key())?;

        let addr = SocketAddr::new(settings.bind_address, settings.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?
            .port();

        Ok((
            listener,
            port,
            TlsAcceptor::from(Arc::new(config)),
            identity.fingerprint(),
        ))
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        // The listener task holds a reference to `shared`; abort it so the
        // socket is released even without an explicit stop().
        if let Ok(mut coord) = self.shared.coordinator.try_lock() {
            if let Some(listener) = coord.listener.take() {
                listener.abort();
            }
            for (_, connection) in coord.connections.drain() {
                connection.abort();
            }
        }
    }
}

// ── Connection handling ───────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                // Usually a transient resource limit (e.g. out of descriptors).
                warn!("accept error: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        debug!("connection from {peer}");

        let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut coord = shared.coordinator.lock().await;
        let task_shared = Arc::clone(&shared);
        let acceptor = acceptor.clone();
        let task = tokio::spawn(async move {
            serve_connection(&task_shared, acceptor, stream, peer).await;
            task_shared
                .coordinator
                .lock()
                .await
                .connections
                .remove(&id);
        });
        coord.connections.insert(id, task.abort_handle());
    }
}

async fn serve_connection(shared: &Shared, acceptor: TlsAcceptor, stream: TcpStream, peer: SocketAddr) {
    let settings = &shared.settings;
    let mut tls = match timeout(settings.handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!("TLS handshake with {peer} failed: {e}");
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {peer} timed out");
            return;
        }
    };

    let response = match read_request(&mut tls, settings.read_timeout).await {
        Ok(Some(req)) => shared.router.handle(&req),
        Ok(None) => {
            debug!("{peer} closed without sending a request");
            return;
        }
        Err(ReadError::Wire(e)) => {
            debug!("rejecting request from {peer}: {e}");
            WireResponse::error(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => {
            debug!("dropping {peer}: {e}");
            return;
        }
    };

    if let Err(e) = write_response(&mut tls, &response, settings.read_timeout).await {
        debug!("failed to deliver response to {peer}: {e}");
    }
}

/// Writes `response` and closes the write half.
///
/// Each step gets `stall_timeout`, so a peer that stops reading cannot pin
/// the connection task.
///
/// # Errors
///
/// Returns an [`std::io::ErrorKind::TimedOut`] error if the write or the
/// shutdown does not finish in time, or the transport error otherwise.
pub async fn write_response<W>(
    writer: &mut W,
    response: &WireResponse,
    stall_timeout: Duration,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response);
    timeout(stall_timeout, writer.write_all(&bytes))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "response write stalled"))??;
    timeout(stall_timeout, writer.shutdown())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "shutdown stalled"))?
}

/// Reads bytes until one complete request is buffered.
///
/// Returns `Ok(None)` if the peer closes before sending anything.  A close in
/// the middle of a request is an [`ReadError::Io`] error.
///
/// # Errors
///
/// Returns [`ReadError::Wire`] for malformed or oversized frames,
/// [`ReadError::TimedOut`] if no bytes arrive for `idle_timeout`, and
/// [`ReadError::Io`] for transport failures.
pub async fn read_request<R>(
    reader: &mut R,
    idle_timeout: Duration,
) -> Result<Option<WireRequest>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Parse::Complete { value, .. } = parse_request(&buf)? {
            return Ok(Some(value));
        }
        let n = timeout(idle_timeout, reader.read(&mut chunk))
            .await
            .map_err(|_| ReadError::TimedOut)??;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ReadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed mid-request",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
