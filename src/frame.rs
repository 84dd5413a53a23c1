//! Tunnel frame envelope.
//!
//! A [`Frame`] is the unit the relay queues and delivers. It is immutable once
//! built; `frame_id` is assigned by the producer and doubles as the poll
//! cursor and the deduplication key.
//!
//! Encoding is JSON with a sorted metadata map, so two frames with identical
//! fields always encode to identical bytes. Payload bytes travel as base64.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock;

/// Metadata key carrying the application-level request id.
pub const META_REQUEST_ID: &str = "request_id";
/// Metadata key carrying a JSON array of `Set-Cookie` strings.
pub const META_COOKIES: &str = "cookies";
/// Metadata key carrying the merged `Cookie` header forwarded to the agent.
pub const META_COOKIE_HEADER: &str = "cookie_header";
/// Metadata key naming the browser a forwarded request came from.
pub const META_BROWSER_CLIENT_ID: &str = "browser_client_id";
/// Metadata key marking static-asset requests.
pub const META_IS_STATIC: &str = "is_static";
/// Metadata key recording the original request path.
pub const META_ORIGINAL_PATH: &str = "original_path";
/// Metadata key recording who forwarded a frame.
pub const META_FORWARDED_VIA: &str = "forwarded_via";

/// Frame kind. Numeric values are part of the wire format.
///
/// Values outside `0..=7` decode to [`FrameType::Unknown`] instead of failing,
/// so a newer peer cannot knock an older relay over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum FrameType {
    Register,
    HttpRequest,
    HttpResponse,
    Ping,
    Pong,
    Data,
    Error,
    Heartbeat,
    Unknown(i32),
}

impl From<i32> for FrameType {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Register,
            1 => Self::HttpRequest,
            2 => Self::HttpResponse,
            3 => Self::Ping,
            4 => Self::Pong,
            5 => Self::Data,
            6 => Self::Error,
            7 => Self::Heartbeat,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for i32 {
    fn from(t: FrameType) -> Self {
        match t {
            FrameType::Register => 0,
            FrameType::HttpRequest => 1,
            FrameType::HttpResponse => 2,
            FrameType::Ping => 3,
            FrameType::Pong => 4,
            FrameType::Data => 5,
            FrameType::Error => 6,
            FrameType::Heartbeat => 7,
            FrameType::Unknown(v) => v,
        }
    }
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::HttpRequest => "HTTP_REQUEST",
            Self::HttpResponse => "HTTP_RESPONSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Data => "DATA",
            Self::Error => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "UNKNOWN({v})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Errors from encoding or decoding frame bytes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has an empty frame_id")]
    MissingId,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(with = "b64", default)]
    pub payload: Vec<u8>,
    /// Codec used for `payload`; empty means the payload is plain.
    #[serde(default)]
    pub obfuscation_method: String,
    /// Cosmetic disguise hint (`json`, `jsonrpc`, ...). Never affects behavior.
    #[serde(default)]
    pub mask_type: String,
    /// Creation time in Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Frame {
    /// Build a frame stamped with the current time and a plain payload.
    pub fn new(frame_id: impl Into<String>, frame_type: FrameType, payload: Vec<u8>) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let timestamp = clock::unix_ms() as i64;
        Self {
            frame_id: frame_id.into(),
            frame_type,
            payload,
            obfuscation_method: String::new(),
            mask_type: String::new(),
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask_type: &str) -> Self {
        self.mask_type = mask_type.to_string();
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Serialize to bytes. Identical frames give identical bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse frame bytes. Unknown frame types are accepted and logged.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let frame: Frame = serde_json::from_slice(bytes)?;
        if frame.frame_id.is_empty() {
            return Err(FrameError::MissingId);
        }
        frame.report_unknown_type();
        Ok(frame)
    }

    /// Log frames whose type this build does not understand.
    pub fn report_unknown_type(&self) {
        if let FrameType::Unknown(v) = self.frame_type {
            warn!(frame_id = %self.frame_id, frame_type = v, "Frame with unknown type accepted");
        }
    }
}

/// Build a frame id of the form `{prefix}_{unix_ms}_{8 hex}`.
pub fn new_frame_id(prefix: &str) -> String {
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", clock::unix_ms(), &rand[..8])
}

/// Serde adapter: `Vec<u8>` as a standard base64 string.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new("f1", FrameType::HttpRequest, b"hello".to_vec())
            .with_timestamp(42)
            .with_meta("b", "2")
            .with_meta("a", "1")
    }

    #[test]
    fn encode_is_byte_identical_for_identical_frames() {
        let mut other = Frame::new("f1", FrameType::HttpRequest, b"hello".to_vec())
            .with_timestamp(42)
            .with_meta("a", "1");
        other.metadata.insert("b".into(), "2".into());
        assert_eq!(sample().encode().unwrap(), other.encode().unwrap());
    }

    #[test]
    fn decode_restores_every_field() {
        let frame = sample().with_mask("jsonrpc");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn type_travels_as_its_numeric_value() {
        let json: serde_json::Value = serde_json::from_slice(&sample().encode().unwrap()).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["payload"], "aGVsbG8=");
    }

    #[test]
    fn unknown_type_is_accepted() {
        let raw = br#"{"frame_id":"x","type":42,"payload":""}"#;
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown(42));
        assert!(frame.metadata.is_empty());
        assert_eq!(i32::from(frame.frame_type), 42);
    }

    #[test]
    fn malformed_bytes_are_an_error() {
        assert!(matches!(
            Frame::decode(b"not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode(br#"{"frame_id":"","type":3}"#),
            Err(FrameError::MissingId)
        ));
    }

    #[test]
    fn frame_ids_are_prefixed_and_unique() {
        let a = new_frame_id("http");
        let b = new_frame_id("http");
        assert!(a.starts_with("http_"));
        assert_ne!(a, b);
    }
}
