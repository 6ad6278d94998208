//! Symmetric peer-to-peer messaging over TCP, with LAN discovery over
//! UDP broadcast.
//!
//! Every node runs the same [`Peer`]: it listens for inbound handshake
//! offers, initiates outbound ones, and keeps a registry of live
//! [`Connection`]s keyed by the remote's `ip:port` name.  Payloads travel
//! as fixed-size plaintext headers followed by encoded bytes; see
//! [`peerlink_core`] for the wire formats.
//!
//! ```no_run
//! use peerlink::{ConnectOptions, Payload, Peer, PeerConfig, PeerHandlers};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handlers = PeerHandlers::new().on_connection(|connection| {
//!     connection.set_data_handler(|connection, payload| {
//!         println!("{}: {payload:?}", connection.remote_name());
//!     });
//!     true
//! });
//! let peer = Peer::start(PeerConfig::default(), handlers)?;
//!
//! let connection = peer.connect("192.168.1.20:41000", ConnectOptions::default())?;
//! connection.send(&Payload::text("hello"))?;
//!
//! peer.stop(false);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
mod discovery;
pub mod events;
pub mod peer;

pub use config::{ConfigError, PeerConfig};
pub use connection::{Connection, LinkSettings, SendError};
pub use events::{ConnectionEvent, ConnectionHandlers, EventError, PeerEvent, PeerHandlers};
pub use peer::{ConnectError, ConnectOptions, Peer, PeerError};

pub use peerlink_core::{DataType, Header, Payload, ProtocolError, Value, HEADER_SIZE};
