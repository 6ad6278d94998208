//! # peerlink-core
//!
//! Shared wire-protocol library for peerlink containing the fixed-size
//! header codec and the payload data-type codecs.
//!
//! This crate is used by every peer role (there is no client/server split;
//! peers are symmetric).  It has zero dependencies on sockets or threads:
//! everything here is pure encode/decode over byte slices.
//!
//! - **`protocol::header`** – The 1024-byte handshake and framing headers
//!   (`HELLO`, `ACCEPT`, `DENY`, `DATA`).  A reader always consumes exactly
//!   [`protocol::HEADER_SIZE`] bytes to obtain one complete header.
//!
//! - **`protocol::payload`** – The negotiated per-link data types: a JSON
//!   envelope, opaque bytes, and an explicit versioned structured-binary
//!   encoding.

pub mod protocol;

pub use protocol::header::Header;
pub use protocol::payload::{DataType, Payload, Value};
pub use protocol::{ProtocolError, HEADER_SIZE};
