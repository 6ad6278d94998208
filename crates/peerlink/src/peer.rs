//! The peer: listening socket, connection registry, handshake protocol,
//! and discovery orchestration.
//!
//! A `Peer` owns one accept loop and (while visible) one discovery
//! responder, each on its own thread, plus one receive thread per live
//! connection.  All loops are cooperative: blocking calls are bounded by
//! the peer's timeout, and every iteration re-checks the shared running
//! flag, so a synchronous [`Peer::stop`] completes within a small multiple
//! of the timeout.
//!
//! # Handshake
//!
//! The initiator sends a `HELLO` header naming itself and the link
//! settings it wants, then waits for `ACCEPT` or `DENY`.  On the accepting
//! side, the first header-sized block read from a fresh socket must be a
//! well-formed `HELLO` (anything else drops the socket silently); the
//! `connection` callback then decides, and only an accepted link is
//! registered and given a receive thread.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use peerlink_core::{DataType, Header, Payload, ProtocolError, HEADER_SIZE};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PeerConfig};
use crate::connection::{lock, read_exact_idle, Connection, LinkSettings, ReadOutcome, SendError};
use crate::discovery;
use crate::events::{EventError, PeerHandlers};

/// Poll interval of the accept loop between connection attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Fatal errors raised while constructing a [`Peer`].
#[derive(Debug, Error)]
pub enum PeerError {
    /// The listening socket could not be bound.
    #[error("failed to bind listening socket at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The configured bind address could not be understood.
    #[error("malformed bind address: {0:?}")]
    Address(String),

    /// A configuration value is out of range.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A required callback is missing.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Any other I/O failure during startup.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure results of [`Peer::connect`].
///
/// Handshake outcomes (`Denied`, `Timeout`, `Refused`) are ordinary
/// results callers must check, not panics.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The target address could not be parsed or resolved.
    #[error("malformed target address: {0:?}")]
    Address(String),

    /// The remote peer replied `DENY`, or closed the socket without
    /// accepting.
    #[error("remote peer denied the connection")]
    Denied,

    /// No handshake reply arrived within the peer's timeout.
    #[error("handshake timed out")]
    Timeout,

    /// The remote host refused the TCP connection.
    #[error("connection refused")]
    Refused,

    /// This peer is already at its configured connection limit.
    #[error("connection limit reached")]
    ConnectionLimit,

    /// The handshake reply could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Any other socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Connect options ───────────────────────────────────────────────────────────

/// Per-link settings chosen by the initiating side of a handshake.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Data type both ends will encode payloads with.
    pub data_type: DataType,
    /// Drop inbound frames whose declared type mismatches.
    pub strict: bool,
    /// Streaming mode: after the first frame, payloads are sent without
    /// headers at a fixed resolved size.
    pub stream: bool,
    /// Fixed streaming frame size; `None` resolves it from the first frame.
    pub data_size: Option<usize>,
    /// Receive chunk size override for this link.
    pub buffer_size: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            data_type: DataType::Json,
            strict: true,
            stream: false,
            data_size: None,
            buffer_size: None,
        }
    }
}

// ── Shared peer state ─────────────────────────────────────────────────────────

/// State shared between the peer handle and its loop threads.
pub(crate) struct PeerShared {
    address_name: String,
    local_ip: IpAddr,
    timeout_ms: AtomicU64,
    running: AtomicBool,
    visible: AtomicBool,
    registry: Mutex<HashMap<String, Arc<Connection>>>,
    handlers: PeerHandlers,
    max_connections: usize,
    buffer_size: usize,
    discovery_port: u16,
    broadcast_address: String,
}

impl PeerShared {
    /// The peer's own `ip:port` name, also used as its handshake identity.
    pub(crate) fn address_name(&self) -> &str {
        &self.address_name
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    pub(crate) fn is_stopping(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub(crate) fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub(crate) fn remove_connection(&self, name: &str) {
        lock(&self.registry).remove(name);
    }
}

#[cfg(test)]
impl PeerShared {
    /// A detached shared state for link-level unit tests.
    pub(crate) fn stub(address_name: &str) -> Arc<Self> {
        Arc::new(Self {
            address_name: address_name.to_string(),
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout_ms: AtomicU64::new(200),
            running: AtomicBool::new(true),
            visible: AtomicBool::new(false),
            registry: Mutex::new(HashMap::new()),
            handlers: PeerHandlers::new(),
            max_connections: 0,
            buffer_size: 8192,
            discovery_port: 1024,
            broadcast_address: "255.255.255.255".to_string(),
        })
    }
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// A symmetric network peer: listens for inbound handshakes, initiates
/// outbound ones, and keeps a registry of live connections keyed by the
/// remote's `ip:port` name.
pub struct Peer {
    shared: Arc<PeerShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    responder_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Binds the listening socket and starts the accept loop and, unless
    /// the config says invisible, the discovery responder.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Bind`] when the address/port cannot be bound,
    /// [`PeerError::Address`] for an unparsable bind address, and
    /// [`PeerError::Event`] when a callback marked required is missing.
    pub fn start(config: PeerConfig, handlers: PeerHandlers) -> Result<Self, PeerError> {
        config.validate()?;

        let (host, port) = resolve_bind_address(&config)?;
        let listener = TcpListener::bind((host.as_str(), port)).map_err(|e| PeerError::Bind {
            addr: format!("{host}:{port}"),
            source: e,
        })?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        let shared = Arc::new(PeerShared {
            address_name: local_addr.to_string(),
            local_ip: local_addr.ip(),
            timeout_ms: AtomicU64::new(config.timeout().as_millis() as u64),
            running: AtomicBool::new(true),
            visible: AtomicBool::new(!config.invisible),
            registry: Mutex::new(HashMap::new()),
            handlers,
            max_connections: config.max_connections,
            buffer_size: config.buffer_size,
            discovery_port: config.discovery_port,
            broadcast_address: config.broadcast_address,
        });

        info!("[{}] listening for connections", shared.address_name());
        shared.handlers.dispatch_listen(shared.address_name())?;

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name(format!("peerlink-accept-{}", shared.address_name()))
            .spawn(move || accept_loop(listener, accept_shared))?;

        let peer = Self {
            shared,
            accept_thread: Mutex::new(Some(accept_thread)),
            responder_thread: Mutex::new(None),
        };
        if !config.invisible {
            peer.spawn_responder();
        }
        Ok(peer)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The bound `ip:port` name of this peer.
    pub fn address_name(&self) -> &str {
        self.shared.address_name()
    }

    /// Current socket timeout.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    /// Changes the socket timeout; live receive loops pick it up on their
    /// next iteration.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Whether this peer currently ignores discovery pings.
    pub fn invisible(&self) -> bool {
        !self.shared.is_visible()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.shared.registry).values().cloned().collect()
    }

    /// Returns the registered connection to `name`, if any.
    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        lock(&self.shared.registry).get(name).cloned()
    }

    // ── Outbound handshake ────────────────────────────────────────────────────

    /// Connects to a remote peer, performing the handshake.
    ///
    /// Idempotent by normalized address: a second call to an address with
    /// a registered live connection returns that connection without
    /// re-handshaking.
    ///
    /// # Errors
    ///
    /// `Denied`, `Timeout`, and `Refused` are ordinary handshake outcomes;
    /// see [`ConnectError`] for the rest.
    pub fn connect(
        &self,
        address: &str,
        options: ConnectOptions,
    ) -> Result<Arc<Connection>, ConnectError> {
        let target = normalize_address(address)?;
        let name = target.to_string();

        if let Some(existing) = self.connection(&name) {
            debug!("[{}] reusing existing connection to {name}", self.address_name());
            return Ok(existing);
        }
        if self.at_capacity() {
            return Err(ConnectError::ConnectionLimit);
        }

        let timeout = self.shared.timeout();
        debug!("[{}] sending offer to {name}", self.address_name());
        let stream = match TcpStream::connect_timeout(&target, timeout) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(ConnectError::Timeout),
            Err(e) => return Err(ConnectError::Io(e)),
        };
        stream.set_read_timeout(Some(timeout))?;

        let hello = Header::Hello {
            peer_name: self.address_name().to_string(),
            data_type: options.data_type,
            strict: options.strict,
        };
        (&stream).write_all(&hello.encode()?)?;

        // One header-sized reply decides the handshake.
        let mut reply = vec![0u8; HEADER_SIZE];
        match read_exact_idle(&stream, &mut reply, &self.shared.running, true)? {
            ReadOutcome::Filled => {}
            ReadOutcome::Idle => return Err(ConnectError::Timeout),
            ReadOutcome::Disconnected => return Err(ConnectError::Denied),
        }
        match Header::decode(&reply)? {
            Header::Accept => {}
            Header::Deny => return Err(ConnectError::Denied),
            other => {
                return Err(ConnectError::Protocol(ProtocolError::Malformed(format!(
                    "unexpected {} reply to an offer",
                    other.tag()
                ))))
            }
        }

        let settings = LinkSettings {
            data_type: options.data_type,
            strict: options.strict,
            stream: options.stream,
            data_size: options.data_size,
            buffer_size: options.buffer_size.unwrap_or(self.shared.buffer_size),
        };
        let connection = Arc::new(Connection::new(
            Arc::clone(&self.shared),
            name.clone(),
            stream,
            settings,
        ));
        lock(&self.shared.registry).insert(name.clone(), Arc::clone(&connection));
        Connection::spawn_receive_loop(&connection)?;

        info!("[{}] connection established with {name}", self.address_name());
        Ok(connection)
    }

    // ── Group operations ──────────────────────────────────────────────────────

    /// Sends one payload to every registered connection.
    ///
    /// Sends are independent: a failure on one connection does not prevent
    /// the others from being attempted.  Returns the failures, keyed by
    /// the remote's name; an empty vector means full delivery.
    pub fn broadcast(&self, payload: &Payload) -> Vec<(String, SendError)> {
        let connections = self.connections();
        let mut failures = Vec::new();
        for connection in connections {
            if let Err(e) = connection.send(payload) {
                warn!(
                    "[{}] broadcast to {} failed: {e}",
                    self.address_name(),
                    connection.remote_name()
                );
                failures.push((connection.remote_name().to_string(), e));
            }
        }
        failures
    }

    /// Pings the local broadcast domain and returns the addresses of the
    /// visible peers that answered within the collection window.
    ///
    /// Best-effort: no retry and no completeness guarantee.
    pub fn local_peers(&self) -> io::Result<Vec<String>> {
        discovery::probe(
            self.address_name(),
            self.shared.local_ip,
            self.shared.discovery_port,
            &self.shared.broadcast_address,
        )
    }

    /// Toggles discovery visibility.  Setting the current value is a
    /// no-op; turning invisible lets the responder thread exit, turning
    /// visible again restarts it.
    pub fn set_invisible(&self, invisible: bool) {
        let visible = !invisible;
        if self.shared.visible.swap(visible, Ordering::AcqRel) == visible {
            return;
        }
        if visible {
            // The previous responder has exited (or will, promptly);
            // reclaim its handle before starting a fresh one.
            if let Some(handle) = lock(&self.responder_thread).take() {
                let _ = handle.join();
            }
            self.spawn_responder();
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stops the peer: raises the cancellation flag and closes every
    /// connection.  When `asynchronous` is false, also joins the accept
    /// loop, the discovery responder, and every receive thread before
    /// returning; shutdown latency is bounded by the configured timeout
    /// per loop.
    pub fn stop(&self, asynchronous: bool) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] stopping", self.address_name());

        // Connections remove themselves from the registry as they die;
        // snapshot first so there is something left to join.
        let connections = self.connections();
        for connection in &connections {
            connection.close(false);
        }

        if asynchronous {
            return;
        }

        if let Some(handle) = lock(&self.accept_thread).take() {
            let _ = handle.join();
        }
        if let Some(handle) = lock(&self.responder_thread).take() {
            let _ = handle.join();
        }
        for connection in &connections {
            connection.join();
        }
        debug!("[{}] stopped", self.address_name());
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn at_capacity(&self) -> bool {
        self.shared.max_connections > 0
            && lock(&self.shared.registry).len() >= self.shared.max_connections
    }

    /// Starts the discovery responder thread.  A bind failure on the
    /// shared discovery port is logged and leaves discovery off; the peer
    /// itself keeps working.
    fn spawn_responder(&self) {
        match discovery::spawn_responder(Arc::clone(&self.shared)) {
            Ok(handle) => *lock(&self.responder_thread) = Some(handle),
            Err(e) => warn!(
                "[{}] discovery responder unavailable on UDP port {}: {e}",
                self.address_name(),
                self.shared.discovery_port
            ),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop(false);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address_name", &self.shared.address_name())
            .field("connections", &lock(&self.shared.registry).len())
            .field("invisible", &self.invisible())
            .finish()
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

fn accept_loop(listener: TcpListener, shared: Arc<PeerShared>) {
    while !shared.is_stopping() {
        let (stream, remote) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                warn!("[{}] accept failed: {e}", shared.address_name());
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
        };

        if let Err(e) = handle_offer(&shared, stream, remote) {
            debug!("[{}] inbound offer from {remote} dropped: {e}", shared.address_name());
        }
    }
    debug!("[{}] accept loop stopped", shared.address_name());
}

/// Runs the accepting side of one handshake.  Sockets that do not present
/// a well-formed `HELLO` are dropped silently.
fn handle_offer(
    shared: &Arc<PeerShared>,
    stream: TcpStream,
    remote: SocketAddr,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(shared.timeout()))?;

    let mut block = vec![0u8; HEADER_SIZE];
    match read_exact_idle(&stream, &mut block, &shared.running, true)? {
        ReadOutcome::Filled => {}
        ReadOutcome::Idle | ReadOutcome::Disconnected => return Ok(()),
    }

    let (peer_name, data_type, strict) = match Header::decode(&block) {
        Ok(Header::Hello {
            peer_name,
            data_type,
            strict,
        }) => (peer_name, data_type, strict),
        Ok(other) => {
            debug!(
                "[{}] ignoring {} from {remote} where an offer was expected",
                shared.address_name(),
                other.tag()
            );
            return Ok(());
        }
        Err(_) => return Ok(()),
    };
    debug!("[{}] offer received from [{peer_name}]", shared.address_name());

    let settings = LinkSettings {
        data_type,
        strict,
        stream: false,
        data_size: None,
        buffer_size: shared.buffer_size,
    };
    let connection = Arc::new(Connection::new(
        Arc::clone(shared),
        peer_name.clone(),
        stream,
        settings,
    ));

    let at_capacity = shared.max_connections > 0
        && lock(&shared.registry).len() >= shared.max_connections;

    let accepted = if at_capacity {
        debug!("[{}] at connection limit, denying [{peer_name}]", shared.address_name());
        false
    } else {
        match shared.handlers.dispatch_connection(&connection) {
            Ok(Some(decision)) => decision,
            // No callback configured to accept: deny.
            Ok(None) => false,
            Err(e) => {
                error!("[{}] {e}; denying offer from [{peer_name}]", shared.address_name());
                false
            }
        }
    };

    if !accepted {
        debug!("[{}] offer from [{peer_name}] denied", shared.address_name());
        if let Err(e) = connection.send_header(&Header::Deny) {
            debug!("[{}] failed to send denial: {e}", shared.address_name());
        }
        return Ok(());
    }

    if let Err(e) = connection.send_header(&Header::Accept) {
        debug!("[{}] failed to send acceptance: {e}", shared.address_name());
        return Ok(());
    }
    lock(&shared.registry).insert(peer_name.clone(), Arc::clone(&connection));
    Connection::spawn_receive_loop(&connection)?;
    info!("[{}] offer from [{peer_name}] accepted", shared.address_name());
    Ok(())
}

// ── Address helpers ───────────────────────────────────────────────────────────

/// Normalizes a `host:port` string into one validated socket address.
fn normalize_address(input: &str) -> Result<SocketAddr, ConnectError> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    input
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConnectError::Address(input.to_string()))
}

/// Splits the configured bind address into host and port, applying the
/// standalone `port` field when the address does not carry one.
fn resolve_bind_address(config: &PeerConfig) -> Result<(String, u16), PeerError> {
    match config.address.as_deref() {
        Some(address) if address.contains(':') => {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| PeerError::Address(address.to_string()))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| PeerError::Address(address.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(host) => Ok((host.to_string(), config.port)),
        None => Ok((local_outbound_ip().to_string(), config.port)),
    }
}

/// Best-effort guess at the host's outbound-routable IP: the local
/// address of a UDP socket "connected" to a public resolver (no packet
/// is actually sent).  Falls back to loopback.
fn local_outbound_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
