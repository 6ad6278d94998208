//! One negotiated link between two peers.
//!
//! A `Connection` is created after a successful handshake (or just before
//! sending the handshake request, on the initiating side).  It owns the TCP
//! socket and a dedicated receive thread; `send` runs synchronously on
//! whatever thread calls it, serialized by a per-connection send lock so
//! concurrent callers cannot interleave header and payload bytes.
//!
//! # Framing
//!
//! Every payload is preceded by a fixed-size `DATA` header announcing its
//! byte length and data type — except in resolved streaming mode, where the
//! frame size is fixed after the first frame and headers are omitted
//! entirely.
//!
//! # Cancellation
//!
//! The receive loop polls an `alive` flag once per iteration, and every
//! blocking read is bounded by the owning peer's timeout (re-read each
//! iteration, so timeout changes take effect on live loops).  A read
//! timeout with no bytes received is not an error; a partially received
//! frame is completed across timeouts so framing never desynchronizes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use peerlink_core::{DataType, Header, Payload, ProtocolError, HEADER_SIZE};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::events::{ConnectionEvent, ConnectionHandlers};
use crate::peer::PeerShared;

/// Read timeout installed by [`Connection::close`] to hasten loop exit.
const CLOSE_POLL: Duration = Duration::from_millis(50);

/// Error type for [`Connection::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The payload's type does not match the link's negotiated data type.
    #[error("payload type `{actual}` does not match the negotiated data type `{expected}`")]
    PayloadType { expected: DataType, actual: DataType },

    /// In resolved streaming mode, the payload length must equal the frame
    /// size established by the first frame.
    #[error("streaming payload is {actual} bytes but the resolved frame size is {expected}")]
    DataSize { expected: usize, actual: usize },

    /// The connection has already been closed.
    #[error("connection is closed")]
    Closed,

    /// Header or payload encoding failed (e.g. header overflow).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The socket write failed; a partial write is a failed send, never a
    /// partial success.
    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
}

/// Per-link settings negotiated at handshake time (or chosen by the
/// initiator before it).
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// The data type both ends encode payloads with.
    pub data_type: DataType,
    /// Whether inbound frames of a mismatched type are dropped.
    pub strict: bool,
    /// Streaming mode: once a frame size is resolved, per-frame headers are
    /// omitted and every payload must match that size exactly.
    pub stream: bool,
    /// Declared streaming frame size; `None` means "auto" (resolved from
    /// the first frame).
    pub data_size: Option<usize>,
    /// Receive chunk size in bytes.
    pub buffer_size: usize,
}

/// The declared streaming frame size, resolved at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameSize {
    Auto,
    Fixed(usize),
}

/// One live link to a remote peer.
pub struct Connection {
    shared: Arc<PeerShared>,
    remote_name: String,
    stream: TcpStream,
    settings: LinkSettings,
    frame_size: Mutex<FrameSize>,
    alive: AtomicBool,
    handlers: RwLock<ConnectionHandlers>,
    send_guard: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<PeerShared>,
        remote_name: String,
        stream: TcpStream,
        settings: LinkSettings,
    ) -> Self {
        let frame_size = match (settings.stream, settings.data_size) {
            (true, Some(size)) => FrameSize::Fixed(size),
            _ => FrameSize::Auto,
        };
        Self {
            shared,
            remote_name,
            stream,
            settings,
            frame_size: Mutex::new(frame_size),
            alive: AtomicBool::new(true),
            handlers: RwLock::new(ConnectionHandlers::new()),
            send_guard: Mutex::new(()),
            thread: Mutex::new(None),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// The remote peer's address name (`ip:port`), its registry key.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// The negotiated data type of this link.
    pub fn data_type(&self) -> DataType {
        self.settings.data_type
    }

    /// Whether mismatched inbound frames are dropped.
    pub fn strict(&self) -> bool {
        self.settings.strict
    }

    /// Whether this link runs in streaming mode.
    pub fn is_streaming(&self) -> bool {
        self.settings.stream
    }

    /// Whether the link is still live.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Installs the `data` callback (usually done from the peer's
    /// `connection` callback).
    pub fn set_data_handler(&self, callback: impl Fn(&Connection, Payload) + Send + Sync + 'static) {
        write_lock(&self.handlers).data = Some(Arc::new(callback));
    }

    /// Installs the `stop` callback.
    pub fn set_stop_handler(&self, callback: impl Fn(&Connection) + Send + Sync + 'static) {
        write_lock(&self.handlers).stop = Some(Arc::new(callback));
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Encodes and sends one payload.
    ///
    /// Outside resolved streaming mode a `DATA` header precedes the payload
    /// bytes.  The whole transfer is atomic with respect to concurrent
    /// `send` calls on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::PayloadType`] if the payload does not match the
    /// negotiated data type, [`SendError::DataSize`] if a resolved
    /// streaming frame has the wrong length (the link stays usable), and
    /// [`SendError::Io`] if the socket write fails.
    pub fn send(&self, payload: &Payload) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        if payload.data_type() != self.settings.data_type {
            return Err(SendError::PayloadType {
                expected: self.settings.data_type,
                actual: payload.data_type(),
            });
        }

        let bytes = payload.encode()?;

        let _guard = lock(&self.send_guard);
        let mut frame_size = lock(&self.frame_size);

        let mut resolves_frame = false;
        if !self.settings.stream || *frame_size == FrameSize::Auto {
            let header = Header::Data {
                data_size: bytes.len(),
                data_type: self.settings.data_type,
            };
            (&self.stream).write_all(&header.encode()?)?;
            resolves_frame = self.settings.stream;
        } else if let FrameSize::Fixed(expected) = *frame_size {
            if bytes.len() != expected {
                return Err(SendError::DataSize {
                    expected,
                    actual: bytes.len(),
                });
            }
        }

        (&self.stream).write_all(&bytes)?;
        // Resolve only once the whole first frame is on the wire; a failed
        // payload write must not leave this end header-less while the
        // receiver never saw a frame.
        if resolves_frame {
            *frame_size = FrameSize::Fixed(bytes.len());
            debug!(
                "[{}] streaming frame size resolved to {} bytes",
                self.remote_name,
                bytes.len()
            );
        }
        trace!("[{}] sent {} bytes", self.remote_name, bytes.len());
        Ok(())
    }

    /// Writes one raw header, used by the peer during the handshake.
    pub(crate) fn send_header(&self, header: &Header) -> Result<(), SendError> {
        let _guard = lock(&self.send_guard);
        (&self.stream).write_all(&header.encode()?)?;
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Closes the connection cooperatively: clears the liveness flag and
    /// shortens the read timeout so the receive loop notices soon.
    ///
    /// With `force`, additionally performs an abortive bidirectional socket
    /// shutdown; data still in flight may be lost, so callers should treat
    /// this as a last resort.
    pub fn close(&self, force: bool) {
        self.alive.store(false, Ordering::Release);
        let _ = self.stream.set_read_timeout(Some(CLOSE_POLL));
        if force {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Spawns the receive loop on its own named thread.
    pub(crate) fn spawn_receive_loop(this: &Arc<Self>) -> io::Result<()> {
        let connection = Arc::clone(this);
        let handle = std::thread::Builder::new()
            .name(format!("peerlink-conn-{}", this.remote_name))
            .spawn(move || connection.receive_loop())?;
        *lock(&this.thread) = Some(handle);
        Ok(())
    }

    /// Joins the receive thread, if any.  Must not be called from the
    /// receive thread itself.
    pub(crate) fn join(&self) {
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }

    // ── Receive loop ──────────────────────────────────────────────────────────

    fn receive_loop(&self) {
        let mut header_buf = vec![0u8; HEADER_SIZE];
        // Forces the first iteration to install the peer's timeout.
        let mut current_timeout = Duration::ZERO;

        while self.is_alive() {
            let timeout = self.shared.timeout();
            if timeout != current_timeout {
                if self.stream.set_read_timeout(Some(timeout)).is_err() {
                    break;
                }
                current_timeout = timeout;
            }

            let resolved = if self.settings.stream {
                match *lock(&self.frame_size) {
                    FrameSize::Fixed(size) => Some(size),
                    FrameSize::Auto => None,
                }
            } else {
                None
            };

            let step = if let Some(frame_size) = resolved {
                // Resolved streaming: no headers, every frame is frame_size bytes.
                match self.read_payload(frame_size, true) {
                    Ok(Some(bytes)) => {
                        self.decode_and_dispatch(&bytes, self.settings.data_type);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            } else {
                match read_exact_idle(&self.stream, &mut header_buf, &self.alive, true) {
                    Ok(ReadOutcome::Filled) => self.handle_header(&header_buf),
                    Ok(ReadOutcome::Idle) => Ok(()),
                    Ok(ReadOutcome::Disconnected) => {
                        debug!("[{}] remote closed the connection", self.remote_name);
                        break;
                    }
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = step {
                warn!("[{}] socket error, closing connection: {e}", self.remote_name);
                break;
            }
        }

        self.teardown();
    }

    /// Processes one received header-sized block.  Anything that is not a
    /// well-formed `DATA` header is ignored.
    fn handle_header(&self, block: &[u8]) -> io::Result<()> {
        let header = match Header::decode(block) {
            Ok(header) => header,
            Err(e) => {
                debug!("[{}] ignoring malformed header: {e}", self.remote_name);
                return Ok(());
            }
        };

        let (data_size, data_type) = match header {
            Header::Data {
                data_size,
                data_type,
            } => (data_size, data_type),
            other => {
                debug!(
                    "[{}] ignoring unexpected {} header on established link",
                    self.remote_name,
                    other.tag()
                );
                return Ok(());
            }
        };

        if self.settings.stream {
            let mut frame_size = lock(&self.frame_size);
            if *frame_size == FrameSize::Auto {
                *frame_size = FrameSize::Fixed(data_size);
                debug!(
                    "[{}] streaming frame size resolved to {data_size} bytes",
                    self.remote_name
                );
            }
        }

        if self.settings.strict && data_type != self.settings.data_type {
            warn!(
                "[{}] dropping frame: data type `{data_type}` does not match \
                 negotiated `{}`",
                self.remote_name, self.settings.data_type
            );
            // Still consume exactly the declared payload bytes so the
            // stream stays frame-aligned.
            self.read_payload(data_size, false)?;
            return Ok(());
        }

        if let Some(bytes) = self.read_payload(data_size, false)? {
            self.decode_and_dispatch(&bytes, data_type);
        }
        Ok(())
    }

    /// Reads exactly `size` payload bytes in buffer-size chunks plus the
    /// remainder.
    ///
    /// `at_boundary` marks the call as starting at a frame boundary (bare
    /// resolved-streaming frames): there a timeout before the first byte is
    /// ordinary idleness and returns `Ok(None)`.  A payload that follows a
    /// consumed `DATA` header is already mid-frame, so those reads retry
    /// across timeouts on every chunk — abandoning the frame would leave
    /// its bytes to be misread as the next header.  `Ok(None)` is then only
    /// returned when the connection is closing.
    fn read_payload(&self, size: usize, at_boundary: bool) -> io::Result<Option<Vec<u8>>> {
        let buffer_size = self.settings.buffer_size;
        // Grown chunk by chunk as bytes actually arrive, so a hostile
        // header cannot demand an arbitrarily large up-front allocation.
        let mut payload = Vec::with_capacity(usize::min(size, buffer_size));

        while payload.len() < size {
            let offset = payload.len();
            let chunk_end = usize::min(offset + buffer_size, size);
            payload.resize(chunk_end, 0);
            let idle_ok = at_boundary && offset == 0;
            match read_exact_idle(
                &self.stream,
                &mut payload[offset..chunk_end],
                &self.alive,
                idle_ok,
            )? {
                ReadOutcome::Filled => {}
                ReadOutcome::Idle => return Ok(None),
                ReadOutcome::Disconnected => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote closed mid-frame",
                    ));
                }
            }
        }

        Ok(Some(payload))
    }

    fn decode_and_dispatch(&self, bytes: &[u8], data_type: DataType) {
        let payload = match Payload::decode(bytes, data_type) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] discarding undecodable payload: {e}", self.remote_name);
                return;
            }
        };

        trace!("[{}] dispatching {} bytes of data", self.remote_name, bytes.len());
        let callback = read_lock(&self.handlers).data.clone();
        match callback {
            Some(callback) => callback(self, payload),
            None => {
                if let Err(e) = read_lock(&self.handlers).absent(ConnectionEvent::Data) {
                    error!("[{}] {e}; closing connection", self.remote_name);
                    self.alive.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Runs exactly once, at receive-loop exit: closes the socket, removes
    /// this connection from the owning peer's registry, and fires `stop`.
    fn teardown(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);

        self.shared.remove_connection(&self.remote_name);

        let callback = read_lock(&self.handlers).stop.clone();
        match callback {
            Some(callback) => callback(self),
            None => {
                if let Err(e) = read_lock(&self.handlers).absent(ConnectionEvent::Stop) {
                    error!("[{}] {e}", self.remote_name);
                }
            }
        }

        debug!("[{}] connection stopped", self.remote_name);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_name", &self.remote_name)
            .field("data_type", &self.settings.data_type)
            .field("strict", &self.settings.strict)
            .field("stream", &self.settings.stream)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ── Blocking-read helpers ─────────────────────────────────────────────────────

pub(crate) enum ReadOutcome {
    /// The buffer was filled completely.
    Filled,
    /// Nothing to read right now (timeout at a frame boundary, or the
    /// liveness flag was cleared mid-frame).
    Idle,
    /// The remote performed an orderly shutdown.
    Disconnected,
}

/// Fills `buf` from the stream, tolerating read timeouts.
///
/// A timeout with zero bytes read returns [`ReadOutcome::Idle`] when
/// `idle_ok` is set; once bytes have been read, the fill continues across
/// timeouts until the buffer is complete or the liveness flag clears.
pub(crate) fn read_exact_idle(
    mut stream: &TcpStream,
    buf: &mut [u8],
    alive: &AtomicBool,
    idle_ok: bool,
) -> io::Result<ReadOutcome> {
    let mut pos = 0;
    while pos < buf.len() {
        match stream.read(&mut buf[pos..]) {
            Ok(0) => return Ok(ReadOutcome::Disconnected),
            Ok(n) => pos += n,
            Err(e) if is_timeout_error(&e) => {
                if pos == 0 && idle_ok {
                    return Ok(ReadOutcome::Idle);
                }
                if !alive.load(Ordering::Acquire) {
                    return Ok(ReadOutcome::Idle);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Filled)
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
pub(crate) fn is_timeout_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ── Lock helpers ──────────────────────────────────────────────────────────────

// A poisoned lock only means another thread panicked while holding it; the
// guarded state is still structurally valid, so recover the guard.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
