//! DiscoveryBrowser: finds holders on the local network.
//!
//! # Moving parts (for beginners)
//!
//! ```text
//!  ServiceScanner ──ScanEvent──►  owner task  ──watch──► subscribers
//!  (UdpScanner)                   │      ▲
//!                                 │      │ completions
//!                                 ▼      │
//!                          JoinSet of ServiceResolver probes
//!                          (TcpProbeResolver, hard timeout)
//! ```
//!
//! - The **scanner** reports raw sightings: a holder appeared, changed
//!   endpoint, or went away.
//! - A sighting is not shown until a **resolver** confirms the endpoint is
//!   reachable.  Each probe runs in a `JoinSet` under a timeout; a probe that
//!   times out is dropped silently.
//! - One **owner task** holds all browser state, so nothing is shared behind
//!   a lock.  Each new sighting of a name bumps a generation counter; a probe
//!   completion whose generation no longer matches (the holder moved or went
//!   away meanwhile) is ignored.
//! - After every change the owner publishes a snapshot sorted by name on a
//!   `tokio::sync::watch` channel.
//!
//! If the scanner fails it is restarted after `restart_delay`.  Stopping the
//! browser aborts the scan and every probe and publishes an empty list.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lansync_core::discovery::{
    DiscoveryMessage, DEFAULT_DISCOVERY_PORT, MAX_DATAGRAM_SIZE, SERVICE_TYPE,
};
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default hard timeout for one resolution probe.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default pause before a failed scanner is restarted.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);
/// Default interval between discovery queries.
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(2);
/// Default silence after which a holder is reported as gone.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 64;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A socket operation failed.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint could not be reached.
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

// ── Public types ──────────────────────────────────────────────────────────────

/// A holder that has been seen and resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Advertised display name; unique key within the list.
    pub id: String,
    pub host: IpAddr,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredService {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Returns `true` if the service was last seen at least `window` before
    /// `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.last_seen >= window
    }
}

/// Raw sighting reported by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Added { name: String, endpoint: SocketAddr },
    Updated { name: String, endpoint: SocketAddr },
    Removed { name: String },
}

/// Produces scan events until it fails or the receiver goes away.
#[async_trait]
pub trait ServiceScanner: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] when scanning cannot continue.
    async fn scan(&self, events: mpsc::Sender<ScanEvent>) -> Result<(), DiscoveryError>;
}

/// Confirms that an advertised endpoint is reachable.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Returns the address actually reached.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the endpoint cannot be reached.
    async fn resolve(&self, endpoint: SocketAddr) -> Result<SocketAddr, DiscoveryError>;
}

/// Browser timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserSettings {
    pub resolve_timeout: Duration,
    pub restart_delay: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

// ── Browser state ─────────────────────────────────────────────────────────────

/// What the owner task must do after applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Nothing,
    Publish,
    Resolve {
        name: String,
        generation: u64,
        endpoint: SocketAddr,
    },
}

/// Browser state, touched only by the owner task.
#[derive(Debug, Default)]
struct BrowserState {
    next_generation: u64,
    /// Resolved services by name.
    services: BTreeMap<String, DiscoveredService>,
    /// Generation and endpoint of the probe allowed to complete, by name.
    pending: HashMap<String, (u64, SocketAddr)>,
}

impl BrowserState {
    fn apply(&mut self, event: ScanEvent, now: DateTime<Utc>) -> Action {
        match event {
            ScanEvent::Added { name, endpoint } | ScanEvent::Updated { name, endpoint } => {
                if let Some(service) = self.services.get_mut(&name) {
                    if service.endpoint() == endpoint {
                        service.last_seen = now;
                        self.pending.remove(&name);
                        return Action::Publish;
                    }
                }
                if self.pending.get(&name).is_some_and(|(_, e)| *e == endpoint) {
                    return Action::Nothing;
                }
                // A probe for a new endpoint supersedes any one in flight.
                self.next_generation += 1;
                let generation = self.next_generation;
                self.pending.insert(name.clone(), (generation, endpoint));
                Action::Resolve {
                    name,
                    generation,
                    endpoint,
                }
            }
            ScanEvent::Removed { name } => {
                self.pending.remove(&name);
                match self.services.remove(&name) {
                    Some(_) => Action::Publish,
                    None => Action::Nothing,
                }
            }
        }
    }

    /// Applies a probe result.  Returns `true` if the snapshot changed.
    fn complete(
        &mut self,
        name: String,
        generation: u64,
        resolved: SocketAddr,
        now: DateTime<Utc>,
    ) -> bool {
        if self.pending.get(&name).map(|(g, _)| *g) != Some(generation) {
            debug!("ignoring stale resolution of {name:?}");
            return false;
        }
        self.pending.remove(&name);
        self.services.insert(
            name.clone(),
            DiscoveredService {
                id: name,
                host: resolved.ip(),
                port: resolved.port(),
                last_seen: now,
            },
        );
        true
    }

    /// Drops the pending marker of a probe that failed or timed out.
    fn abandon(&mut self, name: &str, generation: u64) {
        if self.pending.get(name).map(|(g, _)| *g) == Some(generation) {
            self.pending.remove(name);
        }
    }

    fn snapshot(&self) -> Vec<DiscoveredService> {
        self.services.values().cloned().collect()
    }
}

// ── Browser ───────────────────────────────────────────────────────────────────

type Snapshots = Arc<watch::Sender<Vec<DiscoveredService>>>;
type ProbeOutcome = (String, u64, Option<SocketAddr>);

/// Keeps a live list of reachable holders.
pub struct DiscoveryBrowser {
    scanner: Arc<dyn ServiceScanner>,
    resolver: Arc<dyn ServiceResolver>,
    settings: BrowserSettings,
    snapshots: Snapshots,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryBrowser {
    pub fn new(
        scanner: Arc<dyn ServiceScanner>,
        resolver: Arc<dyn ServiceResolver>,
        settings: BrowserSettings,
    ) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            scanner,
            resolver,
            settings,
            snapshots: Arc::new(tx),
            task: Mutex::new(None),
        }
    }

    /// Starts scanning.  A no-op while already browsing.
    pub fn start_browsing(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.snapshots.send_replace(Vec::new());
        *task = Some(tokio::spawn(run_browser(
            Arc::clone(&self.scanner),
            Arc::clone(&self.resolver),
            self.settings,
            Arc::clone(&self.snapshots),
        )));
        info!("discovery started");
    }

    /// Stops scanning, abandons every probe, and publishes an empty list.
    ///
    /// Waits for the browser task to finish unwinding first, so nothing it
    /// publishes can land after the empty list.
    pub async fn stop_browsing(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("discovery task ended abnormally: {e}");
                }
            }
            info!("discovery stopped");
        }
        self.snapshots.send_replace(Vec::new());
    }

    pub fn is_browsing(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Current list, sorted by name.
    pub fn services(&self) -> Vec<DiscoveredService> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredService>> {
        self.snapshots.subscribe()
    }
}

impl Drop for DiscoveryBrowser {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Owner task.  Aborting it drops both `JoinSet`s, which aborts the scan and
/// every outstanding probe.
async fn run_browser(
    scanner: Arc<dyn ServiceScanner>,
    resolver: Arc<dyn ServiceResolver>,
    settings: BrowserSettings,
    snapshots: Snapshots,
) {
    let mut state = BrowserState::default();
    let mut probes: JoinSet<ProbeOutcome> = JoinSet::new();

    loop {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut scan = JoinSet::new();
        {
            let scanner = Arc::clone(&scanner);
            scan.spawn(async move { scanner.scan(tx).await });
        }

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    on_event(&mut state, event, &mut probes, &resolver, settings, &snapshots);
                }
                Some(joined) = probes.join_next() => {
                    on_probe(&mut state, joined, &snapshots);
                }
                Some(outcome) = scan.join_next() => {
                    match outcome {
                        Ok(Ok(())) => info!("scanner finished, restarting"),
                        Ok(Err(e)) => warn!("scanner failed: {e}"),
                        Err(e) => warn!("scanner task ended abnormally: {e}"),
                    }
                    break;
                }
            }
        }

        // Events sent before the scanner exited.
        while let Ok(event) = rx.try_recv() {
            on_event(&mut state, event, &mut probes, &resolver, settings, &snapshots);
        }

        let restart = tokio::time::sleep(settings.restart_delay);
        tokio::pin!(restart);
        loop {
            tokio::select! {
                () = &mut restart => break,
                Some(joined) = probes.join_next() => {
                    on_probe(&mut state, joined, &snapshots);
                }
            }
        }
    }
}

fn on_event(
    state: &mut BrowserState,
    event: ScanEvent,
    probes: &mut JoinSet<ProbeOutcome>,
    resolver: &Arc<dyn ServiceResolver>,
    settings: BrowserSettings,
    snapshots: &Snapshots,
) {
    debug!("scan event {event:?}");
    match state.apply(event, Utc::now()) {
        Action::Nothing => {}
        Action::Publish => {
            snapshots.send_replace(state.snapshot());
        }
        Action::Resolve {
            name,
            generation,
            endpoint,
        } => {
            let resolver = Arc::clone(resolver);
            probes.spawn(async move {
                let resolved = match timeout(settings.resolve_timeout, resolver.resolve(endpoint)).await {
                    Ok(Ok(addr)) => Some(addr),
                    Ok(Err(e)) => {
                        debug!("probe of {name:?} failed: {e}");
                        None
                    }
                    Err(_) => {
                        debug!("probe of {name:?} at {endpoint} timed out");
                        None
                    }
                };
                (name, generation, resolved)
            });
        }
    }
}

fn on_probe(
    state: &mut BrowserState,
    joined: Result<ProbeOutcome, JoinError>,
    snapshots: &Snapshots,
) {
    let (name, generation, resolved) = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("resolution probe ended abnormally: {e}");
            return;
        }
    };
    match resolved {
        Some(addr) => {
            if state.complete(name, generation, addr, Utc::now()) {
                snapshots.send_replace(state.snapshot());
            }
        }
        None => state.abandon(&name, generation),
    }
}

// ── UDP scanner ───────────────────────────────────────────────────────────────

/// Broadcasts discovery queries and turns the answers into scan events.
#[derive(Debug, Clone)]
pub struct UdpScanner {
    bind_addr: SocketAddr,
    target: SocketAddr,
    query_interval: Duration,
    stale_after: Duration,
}

impl UdpScanner {
    /// Queries `target`, usually the broadcast address on the discovery port.
    pub fn new(target: SocketAddr) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            target,
            query_interval: DEFAULT_QUERY_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Broadcast on the default discovery port.
    pub fn broadcast() -> Self {
        Self::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            DEFAULT_DISCOVERY_PORT,
        ))
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_query_interval(mut self, interval: Duration) -> Self {
        self.query_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, window: Duration) -> Self {
        self.stale_after = window;
        self
    }
}

#[async_trait]
impl ServiceScanner for UdpScanner {
    async fn scan(&self, events: mpsc::Sender<ScanEvent>) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;
        let query = DiscoveryMessage::query().encode();

        let mut seen: HashMap<String, (SocketAddr, Instant)> = HashMap::new();
        let mut ticker = tokio::time::interval(self.query_interval);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => {
                    socket.send_to(&query, self.target).await?;
                    let now = Instant::now();
                    let expired: Vec<String> = seen
                        .iter()
                        .filter(|(_, (_, at))| now.duration_since(*at) >= self.stale_after)
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in expired {
                        seen.remove(&name);
                        debug!("{name:?} went quiet");
                        if events.send(ScanEvent::Removed { name }).await.is_err() {
                            return Ok(());
                        }
                    }
                    continue;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => interpret(&buf[..len], src, &mut seen),
                    Err(e) => {
                        debug!("discovery recv error: {e}");
                        None
                    }
                },
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Maps one datagram to a scan event, updating `seen`.
fn interpret(
    datagram: &[u8],
    src: SocketAddr,
    seen: &mut HashMap<String, (SocketAddr, Instant)>,
) -> Option<ScanEvent> {
    let message = match DiscoveryMessage::decode(datagram) {
        Ok(message) => message,
        Err(e) => {
            debug!("ignoring datagram from {src}: {e}");
            return None;
        }
    };
    if message.service_type() != SERVICE_TYPE {
        return None;
    }
    match message {
        DiscoveryMessage::Advertisement { name, port, .. } => {
            let endpoint = SocketAddr::new(src.ip(), port);
            match seen.insert(name.clone(), (endpoint, Instant::now())) {
                None => Some(ScanEvent::Added { name, endpoint }),
                Some(_) => Some(ScanEvent::Updated { name, endpoint }),
            }
        }
        DiscoveryMessage::Goodbye { name, .. } => seen
            .remove(&name)
            .map(|_| ScanEvent::Removed { name }),
        DiscoveryMessage::Query { .. } => None,
    }
}

// ── TCP probe resolver ────────────────────────────────────────────────────────

/// Resolves by opening (and immediately closing) a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbeResolver;

#[async_trait]
impl ServiceResolver for TcpProbeResolver {
    async fn resolve(&self, endpoint: SocketAddr) -> Result<SocketAddr, DiscoveryError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|source| DiscoveryError::Resolve { endpoint, source })?;
        stream
            .peer_addr()
            .map_err(|source| DiscoveryError::Resolve { endpoint, source })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn added(name: &str, port: u16) -> ScanEvent {
        ScanEvent::Added {
            name: name.to_string(),
            endpoint: ep(port),
        }
    }

    // ── BrowserState ──────────────────────────────────────────────────────────

    #[test]
    fn test_added_requests_resolution_then_completion_publishes() {
        // Arrange
        let mut state = BrowserState::default();

        // Act
        let action = state.apply(added("Kitchen", 4000), now());
        let Action::Resolve { name, generation, endpoint } = action else {
            panic!("expected a resolution request, got {action:?}");
        };
        let changed = state.complete(name, generation, endpoint, now());

        // Assert
        assert!(changed);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "Kitchen");
        assert_eq!(snapshot[0].endpoint(), ep(4000));
    }

    #[test]
    fn test_remove_of_unknown_name_is_noop() {
        let mut state = BrowserState::default();
        let action = state.apply(
            ScanEvent::Removed {
                name: "ghost".to_string(),
            },
            now(),
        );
        assert_eq!(action, Action::Nothing);
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn test_superseded_resolution_is_ignored() {
        // Arrange: the holder moved before the first probe finished
        let mut state = BrowserState::default();
        let Action::Resolve { generation: first, .. } = state.apply(added("A", 1), now()) else {
            panic!("expected resolve");
        };
        let Action::Resolve { generation: second, .. } = state.apply(
            ScanEvent::Updated {
                name: "A".to_string(),
                endpoint: ep(2),
            },
            now(),
        ) else {
            panic!("expected resolve");
        };

        // Act / Assert
        assert!(!state.complete("A".to_string(), first, ep(1), now()));
        assert!(state.snapshot().is_empty());
        assert!(state.complete("A".to_string(), second, ep(2), now()));
        assert_eq!(state.snapshot()[0].port, 2);
    }

    #[test]
    fn test_completion_after_remove_is_ignored() {
        let mut state = BrowserState::default();
        let Action::Resolve { generation, .. } = state.apply(added("A", 1), now()) else {
            panic!("expected resolve");
        };
        state.apply(
            ScanEvent::Removed {
                name: "A".to_string(),
            },
            now(),
        );

        assert!(!state.complete("A".to_string(), generation, ep(1), now()));
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn test_repeat_sighting_while_probing_does_not_reprobe() {
        let mut state = BrowserState::default();
        assert!(matches!(state.apply(added("A", 1), now()), Action::Resolve { .. }));
        assert_eq!(state.apply(added("A", 1), now()), Action::Nothing);
    }

    #[test]
    fn test_same_endpoint_refreshes_without_probe() {
        let mut state = BrowserState::default();
        if let Action::Resolve { name, generation, endpoint } = state.apply(added("A", 1), now()) {
            state.complete(name, generation, endpoint, now());
        }
        let later = now() + chrono::Duration::seconds(30);

        let action = state.apply(
            ScanEvent::Updated {
                name: "A".to_string(),
                endpoint: ep(1),
            },
            later,
        );

        assert_eq!(action, Action::Publish);
        assert_eq!(state.snapshot()[0].last_seen, later);
    }

    #[test]
    fn test_snapshot_is_sorted_by_name() {
        let mut state = BrowserState::default();
        for (name, port) in [("zeta", 1), ("alpha", 2), ("mid", 3)] {
            if let Action::Resolve { name, generation, endpoint } = state.apply(added(name, port), now()) {
                state.complete(name, generation, endpoint, now());
            }
        }
        let ids: Vec<String> = state.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_is_stale_boundary_is_inclusive() {
        let service = DiscoveredService {
            id: "A".to_string(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1,
            last_seen: now(),
        };
        let window = chrono::Duration::seconds(10);
        assert!(!service.is_stale(now() + chrono::Duration::seconds(9), window));
        assert!(service.is_stale(now() + window, window));
    }

    // ── UDP interpretation ────────────────────────────────────────────────────

    #[test]
    fn test_interpret_added_then_updated_then_removed() {
        let mut seen = HashMap::new();
        let src = ep(53317);
        let ad = DiscoveryMessage::Advertisement {
            service_type: SERVICE_TYPE.to_string(),
            name: "H".to_string(),
            port: 4000,
        }
        .encode();
        let bye = DiscoveryMessage::Goodbye {
            service_type: SERVICE_TYPE.to_string(),
            name: "H".to_string(),
        }
        .encode();

        assert!(matches!(interpret(&ad, src, &mut seen), Some(ScanEvent::Added { .. })));
        assert_eq!(
            interpret(&ad, src, &mut seen),
            Some(ScanEvent::Updated {
                name: "H".to_string(),
                endpoint: ep(4000)
            })
        );
        assert!(matches!(interpret(&bye, src, &mut seen), Some(ScanEvent::Removed { .. })));
        assert_eq!(interpret(&bye, src, &mut seen), None);
    }

    #[test]
    fn test_interpret_ignores_other_services_and_garbage() {
        let mut seen = HashMap::new();
        let other = DiscoveryMessage::Advertisement {
            service_type: "_other._tcp".to_string(),
            name: "X".to_string(),
            port: 1,
        }
        .encode();
        assert_eq!(interpret(&other, ep(1), &mut seen), None);
        assert_eq!(interpret(b"\xff\x00garbage", ep(1), &mut seen), None);
        assert!(seen.is_empty());
    }

    // ── Browser task ──────────────────────────────────────────────────────────

    /// Replays scripted events.  The first `failures` calls fail immediately.
    struct ScriptedScanner {
        calls: AtomicUsize,
        failures: usize,
        events: Vec<ScanEvent>,
    }

    #[async_trait]
    impl ServiceScanner for ScriptedScanner {
        async fn scan(&self, tx: mpsc::Sender<ScanEvent>) -> Result<(), DiscoveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DiscoveryError::Io(std::io::Error::other("scripted failure")));
            }
            for event in &self.events {
                let _ = tx.send(event.clone()).await;
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Resolves instantly, except for ports listed in `hang`.
    struct FakeResolver {
        hang: Vec<u16>,
    }

    #[async_trait]
    impl ServiceResolver for FakeResolver {
        async fn resolve(&self, endpoint: SocketAddr) -> Result<SocketAddr, DiscoveryError> {
            if self.hang.contains(&endpoint.port()) {
                std::future::pending::<()>().await;
            }
            Ok(endpoint)
        }
    }

    fn browser(scanner: ScriptedScanner, hang: Vec<u16>) -> DiscoveryBrowser {
        DiscoveryBrowser::new(
            Arc::new(scanner),
            Arc::new(FakeResolver { hang }),
            BrowserSettings {
                resolve_timeout: Duration::from_millis(50),
                restart_delay: Duration::from_millis(20),
            },
        )
    }

    async fn wait_for(
        rx: &mut watch::Receiver<Vec<DiscoveredService>>,
        pred: impl Fn(&[DiscoveredService]) -> bool,
    ) -> Vec<DiscoveredService> {
        timeout(Duration::from_secs(2), async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if pred(&current) {
                        return current.clone();
                    }
                }
                rx.changed().await.expect("browser alive");
            }
        })
        .await
        .expect("condition within timeout")
    }

    #[tokio::test]
    async fn test_browser_publishes_resolved_services() {
        // Arrange
        let b = browser(
            ScriptedScanner {
                calls: AtomicUsize::new(0),
                failures: 0,
                events: vec![added("B", 2), added("A", 1)],
            },
            vec![],
        );
        let mut rx = b.subscribe();

        // Act
        b.start_browsing();
        let services = wait_for(&mut rx, |s| s.len() == 2).await;

        // Assert
        assert_eq!(services[0].id, "A");
        assert_eq!(services[1].id, "B");
        assert!(b.is_browsing());
    }

    #[tokio::test]
    async fn test_browser_drops_probe_that_times_out() {
        let b = browser(
            ScriptedScanner {
                calls: AtomicUsize::new(0),
                failures: 0,
                events: vec![added("Slow", 9), added("Fast", 1)],
            },
            vec![9],
        );
        let mut rx = b.subscribe();

        b.start_browsing();
        wait_for(&mut rx, |s| s.iter().any(|x| x.id == "Fast")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let ids: Vec<String> = b.services().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["Fast"]);
    }

    #[tokio::test]
    async fn test_browser_restarts_failed_scanner() {
        let scanner = Arc::new(ScriptedScanner {
            calls: AtomicUsize::new(0),
            failures: 2,
            events: vec![added("A", 1)],
        });
        let b = DiscoveryBrowser::new(
            scanner.clone(),
            Arc::new(FakeResolver { hang: vec![] }),
            BrowserSettings {
                resolve_timeout: Duration::from_millis(50),
                restart_delay: Duration::from_millis(20),
            },
        );
        let mut rx = b.subscribe();

        b.start_browsing();
        wait_for(&mut rx, |s| s.len() == 1).await;

        assert_eq!(scanner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_publishes_empty_and_restart_starts_empty() {
        // Arrange
        let b = browser(
            ScriptedScanner {
                calls: AtomicUsize::new(0),
                failures: 0,
                events: vec![added("A", 1)],
            },
            vec![],
        );
        let mut rx = b.subscribe();
        b.start_browsing();
        wait_for(&mut rx, |s| s.len() == 1).await;

        // Act
        b.stop_browsing().await;

        // Assert
        assert!(b.services().is_empty());
        assert!(!b.is_browsing());

        b.start_browsing();
        assert!(b.services().is_empty());
        wait_for(&mut rx, |s| s.len() == 1).await;
    }

    /// Announces a new endpoint for the same holder as fast as it can.
    struct ChattyScanner;

    #[async_trait]
    impl ServiceScanner for ChattyScanner {
        async fn scan(&self, tx: mpsc::Sender<ScanEvent>) -> Result<(), DiscoveryError> {
            let mut port = 1u16;
            loop {
                if tx.send(added("Busy", port)).await.is_err() {
                    return Ok(());
                }
                port = port.wrapping_add(1).max(1);
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_leaves_no_stale_services_behind() {
        // Arrange
        let b = DiscoveryBrowser::new(
            Arc::new(ChattyScanner),
            Arc::new(FakeResolver { hang: vec![] }),
            BrowserSettings {
                resolve_timeout: Duration::from_millis(50),
                restart_delay: Duration::from_millis(20),
            },
        );
        let mut rx = b.subscribe();

        for _ in 0..20 {
            b.start_browsing();
            wait_for(&mut rx, |s| !s.is_empty()).await;

            // Act
            b.stop_browsing().await;
            tokio::time::sleep(Duration::from_millis(5)).await;

            // Assert
            assert!(b.services().is_empty());
            assert!(!b.is_browsing());
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_resolver_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let resolved = TcpProbeResolver.resolve(addr).await.unwrap();

        assert_eq!(resolved, addr);
    }
}
