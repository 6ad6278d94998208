//! Payload data types and their codecs.
//!
//! Every link negotiates one [`DataType`] at handshake time:
//!
//! - `json` – a self-describing textual envelope `{"data": <value>}`.
//!   The default, and compatible with any implementation that speaks JSON.
//! - `bytes` – opaque binary pass-through.  The caller must already hold
//!   bytes; nothing is serialized for them.
//! - `raw` – an explicit, versioned structured-binary encoding of a
//!   [`Value`] tree (format below).  This replaces implementation-native
//!   object serializers, which do not interoperate across implementations.
//!
//! # Structured-binary wire format (`raw`)
//!
//! ```text
//! [version:1][value]
//!
//! value := [tag:1][payload]
//!   0x00 Null
//!   0x01 Bool    [byte: 0|1]
//!   0x02 Int     [i64 BE]
//!   0x03 Float   [f64 BE]
//!   0x04 Str     [len: u32 BE][UTF-8 bytes]
//!   0x05 Bytes   [len: u32 BE][bytes]
//!   0x06 List    [count: u32 BE][value...]
//!   0x07 Map     [count: u32 BE][(Str value, value)...]
//! ```
//!
//! All multi-byte integers are big-endian.

use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::{ProtocolError, OBJECT_FORMAT_VERSION};

// ── Data types ────────────────────────────────────────────────────────────────

/// The negotiated data type of a link, exchanged in `HELLO`/`DATA` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    /// Structured text: a JSON envelope (wire token `json`).
    #[default]
    Json,
    /// Opaque binary pass-through (wire token `bytes`).
    Bytes,
    /// Structured binary [`Value`] encoding (wire token `raw`).
    Object,
}

impl DataType {
    /// Returns the wire token used in header fields.
    pub fn as_token(self) -> &'static str {
        match self {
            DataType::Json => "json",
            DataType::Bytes => "bytes",
            DataType::Object => "raw",
        }
    }

    /// Parses a wire token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownDataType`] for anything but
    /// `json`, `bytes` or `raw`.
    pub fn from_token(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "json" => Ok(DataType::Json),
            "bytes" => Ok(DataType::Bytes),
            "raw" => Ok(DataType::Object),
            other => Err(ProtocolError::UnknownDataType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A self-describing structured value, the unit of the `raw` data type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// One message payload, tagged with the data type it encodes as.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Any JSON value, sent inside the `{"data": ...}` envelope.
    Json(serde_json::Value),
    /// Raw bytes, sent as-is.
    Bytes(Vec<u8>),
    /// A structured value, sent in the versioned binary encoding.
    Object(Value),
}

impl Payload {
    /// Convenience constructor for a JSON text payload.
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Json(serde_json::Value::String(s.into()))
    }

    /// Returns the data type this payload encodes as.
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Json(_) => DataType::Json,
            Payload::Bytes(_) => DataType::Bytes,
            Payload::Object(_) => DataType::Object,
        }
    }

    /// Encodes this payload to the bytes that follow a `DATA` header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if JSON serialization fails
    /// (only possible for non-string map keys, which [`serde_json::Value`]
    /// cannot hold anyway).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Payload::Json(value) => {
                let envelope = serde_json::json!({ "data": value });
                serde_json::to_vec(&envelope)
                    .map_err(|e| ProtocolError::Malformed(format!("JSON encoding failed: {e}")))
            }
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Object(value) => {
                let mut buf = Vec::with_capacity(64);
                buf.push(OBJECT_FORMAT_VERSION);
                encode_value(&mut buf, value);
                Ok(buf)
            }
        }
    }

    /// Decodes payload bytes received after a `DATA` header declaring
    /// `data_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the bytes do not form a valid payload
    /// of the declared type.
    pub fn decode(bytes: &[u8], data_type: DataType) -> Result<Payload, ProtocolError> {
        match data_type {
            DataType::Json => {
                let envelope: serde_json::Value = serde_json::from_slice(bytes)
                    .map_err(|e| ProtocolError::Malformed(format!("invalid JSON payload: {e}")))?;
                let data = envelope
                    .as_object()
                    .and_then(|map| map.get("data"))
                    .ok_or_else(|| {
                        ProtocolError::Malformed("JSON payload has no \"data\" envelope".to_string())
                    })?;
                Ok(Payload::Json(data.clone()))
            }
            DataType::Bytes => Ok(Payload::Bytes(bytes.to_vec())),
            DataType::Object => {
                if bytes.is_empty() {
                    return Err(ProtocolError::InsufficientData {
                        needed: 2,
                        available: 0,
                    });
                }
                let version = bytes[0];
                if version != OBJECT_FORMAT_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(version));
                }
                let (value, consumed) = decode_value(&bytes[1..])?;
                if 1 + consumed != bytes.len() {
                    return Err(ProtocolError::Malformed(format!(
                        "{} trailing bytes after object payload",
                        bytes.len() - 1 - consumed
                    )));
                }
                Ok(Payload::Object(value))
            }
        }
    }
}

// ── Value encoding ────────────────────────────────────────────────────────────

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(0x00),
        Value::Bool(b) => {
            buf.push(0x01);
            buf.push(u8::from(*b));
        }
        Value::Int(n) => {
            buf.push(0x02);
            buf.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(x) => {
            buf.push(0x03);
            buf.extend_from_slice(&x.to_be_bytes());
        }
        Value::Str(s) => {
            buf.push(0x04);
            write_length_prefixed(buf, s.as_bytes());
        }
        Value::Bytes(bytes) => {
            buf.push(0x05);
            write_length_prefixed(buf, bytes);
        }
        Value::List(items) => {
            buf.push(0x06);
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(entries) => {
            buf.push(0x07);
            buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
            for (key, item) in entries {
                buf.push(0x04);
                write_length_prefixed(buf, key.as_bytes());
                encode_value(buf, item);
            }
        }
    }
}

// ── Value decoding ────────────────────────────────────────────────────────────

/// Decodes one value from the beginning of `bytes`, returning it and the
/// number of bytes consumed so the caller can advance its cursor.
fn decode_value(bytes: &[u8]) -> Result<(Value, usize), ProtocolError> {
    let tag = *bytes.first().ok_or(ProtocolError::InsufficientData {
        needed: 1,
        available: 0,
    })?;
    let body = &bytes[1..];

    match tag {
        0x00 => Ok((Value::Null, 1)),
        0x01 => {
            require_len(body, 1)?;
            Ok((Value::Bool(body[0] != 0), 2))
        }
        0x02 => {
            require_len(body, 8)?;
            let n = i64::from_be_bytes(body[..8].try_into().unwrap());
            Ok((Value::Int(n), 9))
        }
        0x03 => {
            require_len(body, 8)?;
            let x = f64::from_be_bytes(body[..8].try_into().unwrap());
            Ok((Value::Float(x), 9))
        }
        0x04 => {
            let (raw, consumed) = read_length_prefixed(body)?;
            let s = std::str::from_utf8(raw)
                .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8 string: {e}")))?;
            Ok((Value::Str(s.to_string()), 1 + consumed))
        }
        0x05 => {
            let (raw, consumed) = read_length_prefixed(body)?;
            Ok((Value::Bytes(raw.to_vec()), 1 + consumed))
        }
        0x06 => {
            require_len(body, 4)?;
            let count = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut off = 4;
            for _ in 0..count {
                let (item, consumed) = decode_value(&body[off..])?;
                items.push(item);
                off += consumed;
            }
            Ok((Value::List(items), 1 + off))
        }
        0x07 => {
            require_len(body, 4)?;
            let count = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
            let mut entries = BTreeMap::new();
            let mut off = 4;
            for _ in 0..count {
                let (key, consumed) = decode_value(&body[off..])?;
                off += consumed;
                let Value::Str(key) = key else {
                    return Err(ProtocolError::Malformed(
                        "map key is not a string".to_string(),
                    ));
                };
                let (item, consumed) = decode_value(&body[off..])?;
                off += consumed;
                entries.insert(key, item);
            }
            Ok((Value::Map(entries), 1 + off))
        }
        other => Err(ProtocolError::UnknownValueTag(other)),
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Writes a 4-byte length prefix followed by the bytes.
fn write_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Reads a 4-byte length prefix and then that many bytes.  Returns the
/// bytes and the total number of bytes consumed (prefix included).
fn read_length_prefixed(buf: &[u8]) -> Result<(&[u8], usize), ProtocolError> {
    require_len(buf, 4)?;
    let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    require_len(buf, 4 + len)?;
    Ok((&buf[4..4 + len], 4 + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(payload: &Payload) -> Payload {
        let encoded = payload.encode().expect("encode failed");
        Payload::decode(&encoded, payload.data_type()).expect("decode failed")
    }

    // ── DataType tokens ───────────────────────────────────────────────────────

    #[test]
    fn test_data_type_tokens_round_trip() {
        for data_type in [DataType::Json, DataType::Bytes, DataType::Object] {
            assert_eq!(DataType::from_token(data_type.as_token()), Ok(data_type));
        }
    }

    #[test]
    fn test_data_type_unknown_token_fails() {
        assert!(matches!(
            DataType::from_token("pickle"),
            Err(ProtocolError::UnknownDataType(_))
        ));
    }

    #[test]
    fn test_data_type_default_is_json() {
        assert_eq!(DataType::default(), DataType::Json);
    }

    // ── JSON payloads ─────────────────────────────────────────────────────────

    #[test]
    fn test_json_text_round_trip() {
        let payload = Payload::text("hello");
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_json_envelope_matches_original_wire_form() {
        // Whitespace inside the envelope is not part of the contract; what
        // matters on the wire is that the envelope key is "data".
        let encoded = Payload::text("hello").encode().unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(envelope["data"], json!("hello"));
    }

    #[test]
    fn test_json_structured_value_round_trip() {
        let payload = Payload::Json(json!({
            "user": "ada",
            "scores": [1, 2, 3],
            "active": true,
            "nothing": null,
        }));
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_json_null_data_round_trip() {
        let payload = Payload::Json(json!(null));
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_json_without_envelope_fails() {
        let result = Payload::decode(b"\"bare string\"", DataType::Json);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_json_invalid_utf8_fails() {
        let result = Payload::decode(&[0xFF, 0xFE], DataType::Json);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    // ── Bytes payloads ────────────────────────────────────────────────────────

    #[test]
    fn test_bytes_round_trip() {
        let payload = Payload::Bytes(vec![0x00, 0xFF, 0x7F, 0x80]);
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_bytes_empty_round_trip() {
        let payload = Payload::Bytes(Vec::new());
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_bytes_buffer_spanning_round_trip() {
        // Larger than the default 8192-byte receive buffer, so a receiver
        // reassembles it from multiple chunks.
        let payload = Payload::Bytes((0..=u8::MAX).cycle().take(3 * 8192 + 17).collect());
        assert_eq!(round_trip(&payload), payload);
    }

    // ── Object payloads ───────────────────────────────────────────────────────

    #[test]
    fn test_object_scalars_round_trip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(6.022e23),
            Value::Str(String::new()),
            Value::Str("héllo wörld".to_string()),
            Value::Bytes(vec![1, 2, 3]),
        ] {
            let payload = Payload::Object(value);
            assert_eq!(round_trip(&payload), payload);
        }
    }

    #[test]
    fn test_object_nested_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::Str("ada".to_string()));
        map.insert(
            "history".to_string(),
            Value::List(vec![
                Value::Int(1),
                Value::List(vec![Value::Null, Value::Bool(false)]),
                Value::Map(BTreeMap::new()),
            ]),
        );
        let payload = Payload::Object(Value::Map(map));
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_object_encoding_starts_with_version_byte() {
        let encoded = Payload::Object(Value::Null).encode().unwrap();
        assert_eq!(encoded[0], OBJECT_FORMAT_VERSION);
    }

    #[test]
    fn test_object_unsupported_version_fails() {
        let result = Payload::decode(&[0x63, 0x00], DataType::Object);
        assert_eq!(result, Err(ProtocolError::UnsupportedVersion(0x63)));
    }

    #[test]
    fn test_object_unknown_tag_fails() {
        let result = Payload::decode(&[OBJECT_FORMAT_VERSION, 0x63], DataType::Object);
        assert_eq!(result, Err(ProtocolError::UnknownValueTag(0x63)));
    }

    #[test]
    fn test_object_truncated_string_fails() {
        // Declares a 10-byte string but provides 2.
        let bytes = [OBJECT_FORMAT_VERSION, 0x04, 0, 0, 0, 10, b'h', b'i'];
        let result = Payload::decode(&bytes, DataType::Object);
        assert!(matches!(
            result,
            Err(ProtocolError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_object_trailing_garbage_fails() {
        let mut encoded = Payload::Object(Value::Int(7)).encode().unwrap();
        encoded.push(0x00);
        let result = Payload::decode(&encoded, DataType::Object);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_object_empty_input_fails() {
        let result = Payload::decode(&[], DataType::Object);
        assert!(matches!(
            result,
            Err(ProtocolError::InsufficientData { .. })
        ));
    }

    // ── Payload/data-type mapping ─────────────────────────────────────────────

    #[test]
    fn test_payload_reports_its_data_type() {
        assert_eq!(Payload::text("x").data_type(), DataType::Json);
        assert_eq!(Payload::Bytes(vec![]).data_type(), DataType::Bytes);
        assert_eq!(Payload::Object(Value::Null).data_type(), DataType::Object);
    }
}
