//! Codec for the fixed-size protocol headers.
//!
//! Wire format (always exactly [`HEADER_SIZE`] bytes):
//!
//! ```text
//! TAG|key1=value1&key2=value2||||...padding...||||
//! ```
//!
//! The tag is one of `HELLO`, `ACCEPT`, `DENY`, `DATA`.  The body is a
//! `&`-joined list of `key=value` fields, separated from the tag by a single
//! `|`; headers with no fields carry no body.  The remainder of the
//! allocation is right-padded with `|` so a reader can always consume
//! exactly [`HEADER_SIZE`] bytes.
//!
//! Decoding is tolerant: trailing padding and unknown keys are ignored and
//! fields may arrive in any order.  Encoding is strict: a header whose
//! unpadded form exceeds the allocation fails with
//! [`ProtocolError::HeaderOverflow`] rather than truncating.

use std::fmt;

use crate::protocol::payload::DataType;
use crate::protocol::{ProtocolError, HEADER_SIZE};

/// Separator between the tag and the body, and the padding filler byte.
const TAG_SEPARATOR: char = '|';
/// Separator between `key=value` fields in the body.
const VALUES_SEPARATOR: char = '&';
/// Separator between a key and its value.
const KEY_SEPARATOR: char = '=';

/// One protocol header, ready to be encoded at the fixed header size.
///
/// `Hello`, `Accept` and `Deny` make up the handshake; `Data` announces the
/// size and type of the payload bytes that immediately follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Handshake request from the initiating peer.
    Hello {
        /// The initiator's address name (`ip:port`), used as its registry key.
        peer_name: String,
        /// The data type the initiator will send on this link.
        data_type: DataType,
        /// Whether mismatched inbound frames should be dropped.
        strict: bool,
    },
    /// Handshake accepted; the link is live.
    Accept,
    /// Handshake denied; the socket will be closed.
    Deny,
    /// Frame header preceding `data_size` bytes of encoded payload.
    Data { data_size: usize, data_type: DataType },
}

impl Header {
    /// Returns the wire tag for this header.
    pub fn tag(&self) -> &'static str {
        match self {
            Header::Hello { .. } => "HELLO",
            Header::Accept => "ACCEPT",
            Header::Deny => "DENY",
            Header::Data { .. } => "DATA",
        }
    }

    /// Encodes this header into exactly [`HEADER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HeaderOverflow`] if the unpadded encoding
    /// is larger than the fixed allocation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlink_core::{Header, HEADER_SIZE};
    ///
    /// let bytes = Header::Accept.encode().unwrap();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// assert_eq!(Header::decode(&bytes).unwrap(), Header::Accept);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.body();
        let mut text = String::with_capacity(HEADER_SIZE);
        text.push_str(self.tag());
        if !body.is_empty() {
            text.push(TAG_SEPARATOR);
            text.push_str(&body);
        }

        if text.len() > HEADER_SIZE {
            return Err(ProtocolError::HeaderOverflow {
                size: text.len(),
                limit: HEADER_SIZE,
            });
        }

        let mut bytes = text.into_bytes();
        bytes.resize(HEADER_SIZE, TAG_SEPARATOR as u8);
        Ok(bytes)
    }

    /// Decodes one header from a header-sized block.
    ///
    /// Trailing padding is ignored, unknown keys are skipped, and fields may
    /// appear in any order.  A field that does not split into exactly one
    /// key and one value makes the whole header malformed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the bytes are not valid UTF-8, the tag
    /// is unknown, or a required field is missing or unparsable.
    pub fn decode(bytes: &[u8]) -> Result<Header, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("header is not UTF-8: {e}")))?;

        // Everything past the first separator is body + padding.
        let (tag, body) = match text.find(TAG_SEPARATOR) {
            Some(idx) => (&text[..idx], text[idx + 1..].trim_end_matches(TAG_SEPARATOR)),
            None => (text, ""),
        };

        let fields = split_fields(body)?;

        match tag {
            "HELLO" => Ok(Header::Hello {
                peer_name: require_field(&fields, "peer_name")?.to_string(),
                data_type: DataType::from_token(require_field(&fields, "data_type")?)?,
                strict: parse_bool(require_field(&fields, "strict")?)?,
            }),
            "ACCEPT" => Ok(Header::Accept),
            "DENY" => Ok(Header::Deny),
            "DATA" => Ok(Header::Data {
                data_size: parse_int(require_field(&fields, "data_size")?)?,
                data_type: DataType::from_token(require_field(&fields, "data_type")?)?,
            }),
            other => Err(ProtocolError::UnknownHeaderTag(other.to_string())),
        }
    }

    /// Renders this header's `key=value` body (empty for `ACCEPT`/`DENY`).
    fn body(&self) -> String {
        match self {
            Header::Hello {
                peer_name,
                data_type,
                strict,
            } => join_fields(&[
                ("peer_name", peer_name.clone()),
                ("data_type", data_type.as_token().to_string()),
                ("strict", strict.to_string()),
            ]),
            Header::Accept | Header::Deny => String::new(),
            Header::Data {
                data_size,
                data_type,
            } => join_fields(&[
                ("data_size", data_size.to_string()),
                ("data_type", data_type.as_token().to_string()),
            ]),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body();
        if body.is_empty() {
            write!(f, "{}", self.tag())
        } else {
            write!(f, "{}{}{}", self.tag(), TAG_SEPARATOR, body)
        }
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn join_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}{KEY_SEPARATOR}{value}"))
        .collect::<Vec<_>>()
        .join(&VALUES_SEPARATOR.to_string())
}

/// Splits a header body into `(key, value)` pairs.
fn split_fields(body: &str) -> Result<Vec<(&str, &str)>, ProtocolError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(VALUES_SEPARATOR)
        .map(|part| {
            let mut halves = part.splitn(2, KEY_SEPARATOR);
            match (halves.next(), halves.next()) {
                (Some(key), Some(value)) if !key.is_empty() => Ok((key, value)),
                _ => Err(ProtocolError::Malformed(format!(
                    "header field {part:?} does not split into key and value"
                ))),
            }
        })
        .collect()
}

fn require_field<'a>(fields: &[(&'a str, &'a str)], key: &str) -> Result<&'a str, ProtocolError> {
    fields
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing header field {key:?}")))
}

fn parse_int(value: &str) -> Result<usize, ProtocolError> {
    value
        .parse::<usize>()
        .map_err(|_| ProtocolError::Malformed(format!("expected an integer, got {value:?}")))
}

fn parse_bool(value: &str) -> Result<bool, ProtocolError> {
    // Python-style "True"/"False" capitalisation is accepted on the wire.
    match value {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        _ => Err(ProtocolError::Malformed(format!(
            "expected a boolean, got {value:?}"
        ))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
