//! Wire protocol: header codec, payload codecs, and protocol constants.

pub mod header;
pub mod payload;

use thiserror::Error;

/// Total size of every protocol header on the wire, in bytes.
///
/// Both ends of a link must agree on this value; a reader always consumes
/// exactly this many bytes to obtain one complete, self-contained header.
pub const HEADER_SIZE: usize = 1024;

/// Well-known UDP port for LAN discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 1024;

/// Format version byte of the structured-binary (`raw`) payload encoding.
pub const OBJECT_FORMAT_VERSION: u8 = 0x01;

/// Errors that can occur during header or payload encoding and decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The unpadded header encoding exceeds the fixed header allocation.
    /// Raised at encode time; a header is never silently truncated.
    #[error("header size ({size} bytes) exceeds the protocol's fixed allocation ({limit} bytes)")]
    HeaderOverflow { size: usize, limit: usize },

    /// The header tag is not one of `HELLO`, `ACCEPT`, `DENY`, `DATA`.
    #[error("unknown header tag: {0:?}")]
    UnknownHeaderTag(String),

    /// The data-type token is not one of `json`, `bytes`, `raw`.
    #[error("unknown data type: {0:?}")]
    UnknownDataType(String),

    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The structured-binary format version is not supported.
    #[error("unsupported object format version: 0x{0:02X}")]
    UnsupportedVersion(u8),

    /// A value tag in the structured-binary encoding is not recognized.
    #[error("unknown value tag: 0x{0:02X}")]
    UnknownValueTag(u8),

    /// The bytes could not be parsed (bad field syntax, UTF-8 error,
    /// JSON error, trailing garbage, ...).
    #[error("malformed data: {0}")]
    Malformed(String),
}
