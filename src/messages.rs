//! Request/response messages of the `tunnel.TunnelService` endpoints and the
//! gRPC-Web message framing they travel in.
//!
//! Field names and enum numbers match what deployed agents and browser
//! clients already speak; the bodies themselves are JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::{b64, Frame};

/// Role a client declares at registration. `LAPTOP` is the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "i32", into = "i32")]
pub enum ClientType {
    #[default]
    Unspecified,
    Laptop,
    Browser,
}

impl From<i32> for ClientType {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::Laptop,
            2 => Self::Browser,
            _ => Self::Unspecified,
        }
    }
}

impl From<ClientType> for i32 {
    fn from(t: ClientType) -> Self {
        match t {
            ClientType::Unspecified => 0,
            ClientType::Laptop => 1,
            ClientType::Browser => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_app_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    /// Empty for browsers; only agents own a tunnel.
    pub tunnel_id: String,
    pub server_version: String,
    pub obfuscation_method: String,
    pub server_time: u64,
    pub success: bool,
    pub message: String,
}

/// An HTTP request carried inside an `HTTP_REQUEST` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// JSON object serialized as a string.
    #[serde(default)]
    pub headers: String,
    #[serde(with = "b64", default)]
    pub body: Vec<u8>,
    /// JSON object serialized as a string.
    #[serde(default)]
    pub query: String,
}

/// An HTTP response carried inside an `HTTP_RESPONSE` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_text: String,
    /// JSON object serialized as a string.
    #[serde(default)]
    pub headers: String,
    #[serde(with = "b64", default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRequest {
    pub client_id: String,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default)]
    pub last_frame_id: String,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub frames: Vec<Frame>,
    pub has_more: bool,
    /// Suggested delay before the next poll, in milliseconds.
    pub next_poll_in: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFrameRequest {
    pub frame: Frame,
    pub client_id: String,
    #[serde(default)]
    pub tunnel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFrameResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: u64,
}

/// Parse a JSON-object-as-string header field into `(name, value)` pairs.
///
/// Array values (multiple `Set-Cookie` headers) yield one pair per element.
/// Malformed input yields no pairs.
pub fn header_pairs(raw: &str) -> Vec<(String, String)> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let mut pairs = Vec::with_capacity(map.len());
    for (name, value) in map {
        match value {
            Value::String(s) => pairs.push((name, s)),
            Value::Array(items) => {
                for item in items {
                    if let Value::String(s) = item {
                        pairs.push((name.clone(), s));
                    }
                }
            }
            Value::Null => {}
            other => pairs.push((name, other.to_string())),
        }
    }
    pairs
}

/// Serialize header pairs into a JSON-object string. Repeated names become arrays.
pub fn headers_to_json<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map = Map::new();
    for (name, value) in pairs {
        match map.get_mut(name) {
            Some(Value::Array(items)) => items.push(Value::String(value.to_string())),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value.to_string())]);
            }
            None => {
                map.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
    }
    Value::Object(map).to_string()
}

// ─── gRPC-Web framing ────────────────────────────────────────────────────────

/// Content type used for framed responses.
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

const DATA_FLAG: u8 = 0x00;
const TRAILER_FLAG: u8 = 0x80;

/// Prefix a message with the 5-byte gRPC-Web data header.
pub fn grpc_web_wrap(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 5);
    out.push(DATA_FLAG);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out
}

/// Strip the gRPC-Web data header if present.
///
/// Bodies shorter than a header pass through untouched; a declared length
/// that overruns the body yields everything after the header.
pub fn grpc_web_unwrap(body: &[u8]) -> &[u8] {
    if body.len() < 5 {
        return body;
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if body.len() >= 5 + len {
        &body[5..5 + len]
    } else {
        &body[5..]
    }
}

/// Build a trailers-only gRPC-Web error body.
pub fn grpc_web_error(status: u32, message: &str) -> Vec<u8> {
    let trailers = format!(
        "grpc-status: {status}\r\ngrpc-message: {}",
        percent_encode(message)
    );
    let mut out = Vec::with_capacity(trailers.len() + 5);
    out.push(TRAILER_FLAG);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(trailers.len() as u32).to_be_bytes());
    out.extend_from_slice(trailers.as_bytes());
    out
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            use std::fmt::Write;
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_type_numbers() {
        let req: RegistrationRequest =
            serde_json::from_str(r#"{"client_id":"a","client_type":1}"#).unwrap();
        assert_eq!(req.client_type, ClientType::Laptop);
        assert_eq!(i32::from(ClientType::Browser), 2);
        assert_eq!(ClientType::from(9), ClientType::Unspecified);
    }

    #[test]
    fn grpc_web_framing() {
        let wrapped = grpc_web_wrap(b"{}");
        assert_eq!(wrapped, vec![0, 0, 0, 0, 2, b'{', b'}']);
        assert_eq!(grpc_web_unwrap(&wrapped), b"{}");
        // Unframed bodies are accepted as-is.
        assert_eq!(grpc_web_unwrap(b"{}"), b"{}");
    }

    #[test]
    fn grpc_web_error_is_a_trailer_frame() {
        let body = grpc_web_error(13, "bad frame");
        assert_eq!(body[0], 0x80);
        let text = std::str::from_utf8(&body[5..]).unwrap();
        assert_eq!(text, "grpc-status: 13\r\ngrpc-message: bad%20frame");
    }

    #[test]
    fn header_pairs_flatten_arrays() {
        let pairs = header_pairs(r#"{"content-type":"text/html","set-cookie":["a=1","b=2"]}"#);
        assert_eq!(
            pairs,
            vec![
                ("content-type".to_string(), "text/html".to_string()),
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ]
        );
        assert!(header_pairs("garbage").is_empty());
    }

    #[test]
    fn headers_to_json_groups_repeats() {
        let json = headers_to_json([("a", "1"), ("set-cookie", "x=1"), ("set-cookie", "y=2")]);
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["a"], "1");
        assert_eq!(v["set-cookie"][1], "y=2");
    }
}
