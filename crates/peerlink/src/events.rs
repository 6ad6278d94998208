//! Named-event callback tables for [`Peer`](crate::Peer) and
//! [`Connection`](crate::Connection).
//!
//! Each owner has a closed set of event kinds, and at most one callback per
//! kind.  Callbacks are invoked synchronously on the thread that raised the
//! event (the accept thread for `connection`, a link's receive thread for
//! `data`/`stop`), so they should return quickly.
//!
//! Dispatching an event with no registered callback is a no-op, unless the
//! kind has been marked required for that owner — then the absence is a
//! configuration error surfaced at dispatch time.

use std::fmt;
use std::sync::Arc;

use peerlink_core::Payload;
use thiserror::Error;

use crate::connection::Connection;

/// Error type for event dispatch.
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// A required event kind has no registered callback.
    #[error("no callback registered for required event {0:?}")]
    MissingHandler(&'static str),
}

/// Event kinds raised by a [`Peer`](crate::Peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The accept loop has started listening; carries the local address name.
    Listen,
    /// An inbound handshake awaits an accept/deny decision.
    Connection,
}

/// Event kinds raised by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A decoded payload arrived.
    Data,
    /// The link closed and was removed from its peer's registry.
    Stop,
}

impl PeerEvent {
    fn name(self) -> &'static str {
        match self {
            PeerEvent::Listen => "listen",
            PeerEvent::Connection => "connection",
        }
    }
}

impl ConnectionEvent {
    fn name(self) -> &'static str {
        match self {
            ConnectionEvent::Data => "data",
            ConnectionEvent::Stop => "stop",
        }
    }
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callback invoked when a peer starts listening, with its address name.
pub type ListenFn = dyn Fn(&str) + Send + Sync;
/// Callback deciding whether to accept an inbound handshake.
pub type AcceptFn = dyn Fn(&Connection) -> bool + Send + Sync;
/// Callback invoked with each decoded inbound payload.
pub type DataFn = dyn Fn(&Connection, Payload) + Send + Sync;
/// Callback invoked once when a connection stops.
pub type StopFn = dyn Fn(&Connection) + Send + Sync;

// ── Peer handlers ─────────────────────────────────────────────────────────────

/// The callback table of a [`Peer`](crate::Peer), fixed at construction.
#[derive(Clone, Default)]
pub struct PeerHandlers {
    listen: Option<Arc<ListenFn>>,
    connection: Option<Arc<AcceptFn>>,
    required: &'static [PeerEvent],
}

impl PeerHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the `listen` callback.
    pub fn on_listen(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.listen = Some(Arc::new(callback));
        self
    }

    /// Registers the `connection` accept/deny callback.
    pub fn on_connection(
        mut self,
        callback: impl Fn(&Connection) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.connection = Some(Arc::new(callback));
        self
    }

    /// Marks event kinds whose absence at dispatch time is an error.
    pub fn require(mut self, events: &'static [PeerEvent]) -> Self {
        self.required = events;
        self
    }

    pub(crate) fn dispatch_listen(&self, address_name: &str) -> Result<(), EventError> {
        match &self.listen {
            Some(callback) => {
                callback(address_name);
                Ok(())
            }
            None => self.absent(PeerEvent::Listen),
        }
    }

    /// Returns the callback's decision, or `None` when no callback is
    /// registered (the caller treats that as deny).
    pub(crate) fn dispatch_connection(
        &self,
        connection: &Connection,
    ) -> Result<Option<bool>, EventError> {
        match &self.connection {
            Some(callback) => Ok(Some(callback(connection))),
            None => self.absent(PeerEvent::Connection).map(|()| None),
        }
    }

    fn absent(&self, event: PeerEvent) -> Result<(), EventError> {
        if self.required.contains(&event) {
            Err(EventError::MissingHandler(event.name()))
        } else {
            tracing::trace!("no callback for peer event {event}, skipping");
            Ok(())
        }
    }
}

impl fmt::Debug for PeerHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandlers")
            .field("listen", &self.listen.is_some())
            .field("connection", &self.connection.is_some())
            .field("required", &self.required)
            .finish()
    }
}

// ── Connection handlers ───────────────────────────────────────────────────────

/// The callback table of a [`Connection`](crate::Connection).
///
/// Unlike [`PeerHandlers`] this table is mutable after construction: the
/// `connection` callback usually installs the `data` handler on the link it
/// is deciding about.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    pub(crate) data: Option<Arc<DataFn>>,
    pub(crate) stop: Option<Arc<StopFn>>,
    pub(crate) required: &'static [ConnectionEvent],
}

impl ConnectionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the `data` callback.
    pub fn on_data(mut self, callback: impl Fn(&Connection, Payload) + Send + Sync + 'static) -> Self {
        self.data = Some(Arc::new(callback));
        self
    }

    /// Registers the `stop` callback.
    pub fn on_stop(mut self, callback: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.stop = Some(Arc::new(callback));
        self
    }

    /// Marks event kinds whose absence at dispatch time is an error.
    pub fn require(mut self, events: &'static [ConnectionEvent]) -> Self {
        self.required = events;
        self
    }

    pub(crate) fn absent(&self, event: ConnectionEvent) -> Result<(), EventError> {
        if self.required.contains(&event) {
            Err(EventError::MissingHandler(event.name()))
        } else {
            tracing::trace!("no callback for connection event {event}, skipping");
            Ok(())
        }
    }
}

impl fmt::Debug for ConnectionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlers")
            .field("data", &self.data.is_some())
            .field("stop", &self.stop.is_some())
            .field("required", &self.required)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
