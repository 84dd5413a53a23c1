//! Reversible payload transforms that make tunnel traffic look like ordinary
//! RPC bodies.
//!
//! Three codecs are available: plain base64, a repeating-key XOR stream and
//! AES-256-GCM. Every [`Envelope`] names the method that produced it, so a
//! receiver can open it no matter how often the [`Rotator`] has moved on.

pub mod aead;
pub mod plain;
pub mod rotator;
pub mod xor;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::frame::{b64, Frame};

pub use rotator::Rotator;

/// Name of a codec. The string forms are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Base64,
    Xor,
    Aes,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Xor, Method::Aes, Method::Base64];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base64 => "base64",
            Self::Xor => "xor",
            Self::Aes => "aes",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base64" => Ok(Self::Base64),
            "xor" => Ok(Self::Xor),
            "aes" | "aes-256-gcm" => Ok(Self::Aes),
            other => Err(CodecError::UnknownMethod(other.to_string())),
        }
    }
}

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown obfuscation method: {0}")]
    UnknownMethod(String),
    /// The AEAD tag did not verify. No plaintext is ever returned in this case.
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("envelope was sealed with a different key (hash {0})")]
    KeyMismatch(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encryption,
}

/// Self-describing output of one obfuscate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_b64")]
    pub iv: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_b64")]
    pub auth_tag: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub(crate) fn new(method: Method, data: Vec<u8>) -> Self {
        Self {
            method: method.as_str().to_string(),
            data,
            iv: None,
            auth_tag: None,
            key_hash: None,
            timestamp: crate::clock::unix_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// One reversible transform.
pub trait Codec: Send + Sync {
    fn method(&self) -> Method;
    fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CodecError>;
    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;
}

/// The full family of codecs, keyed by [`Method`].
pub struct CodecSet {
    plain: plain::Base64Codec,
    xor: xor::XorCodec,
    aes: aead::AesGcmCodec,
}

impl CodecSet {
    pub fn new(xor: xor::XorCodec, aes: aead::AesGcmCodec) -> Self {
        Self {
            plain: plain::Base64Codec,
            xor,
            aes,
        }
    }

    /// Build from configured key material. A missing AES key yields a random
    /// per-process key.
    pub fn from_keys(aes_key_hex: Option<&str>, xor_key: &str) -> Result<Self, CodecError> {
        let aes = match aes_key_hex {
            Some(hex) if !hex.is_empty() => aead::AesGcmCodec::from_hex(hex)?,
            _ => {
                warn!("No AES key configured, using a random per-process key");
                aead::AesGcmCodec::random()
            }
        };
        Ok(Self::new(xor::XorCodec::new(xor_key.as_bytes()), aes))
    }

    pub fn codec(&self, method: Method) -> &dyn Codec {
        match method {
            Method::Base64 => &self.plain,
            Method::Xor => &self.xor,
            Method::Aes => &self.aes,
        }
    }

    /// Seal with the named method, falling back to base64 for names this build
    /// does not know.
    pub fn obfuscate(&self, data: &[u8], method: &str) -> Result<Envelope, CodecError> {
        let method = method.parse().unwrap_or_else(|_| {
            warn!(method, "Unknown obfuscation method requested, using base64");
            Method::Base64
        });
        self.codec(method).seal(data)
    }

    /// Open an envelope with the codec it names.
    pub fn deobfuscate(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let method: Method = envelope.method.parse()?;
        self.codec(method).open(envelope)
    }

    /// Like [`deobfuscate`](Self::deobfuscate), but an unrecognized method is
    /// read as base64 instead of failing the whole frame.
    pub fn deobfuscate_lenient(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        match self.deobfuscate(envelope) {
            Err(CodecError::UnknownMethod(m)) => {
                warn!(method = %m, "Unknown obfuscation method on inbound envelope, reading as base64");
                Ok(envelope.data.clone())
            }
            other => other,
        }
    }

    /// Plain payload of a frame. An empty `obfuscation_method` means the
    /// payload is already plain; otherwise it is a serialized [`Envelope`].
    pub fn open_frame(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        if frame.obfuscation_method.is_empty() {
            return Ok(frame.payload.clone());
        }
        let envelope = Envelope::from_bytes(&frame.payload)?;
        self.deobfuscate_lenient(&envelope)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as an optional base64 string.
mod opt_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| STANDARD.decode(s.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn set() -> CodecSet {
        CodecSet::from_keys(Some(KEY), "default-32-byte-key-for-xor-obfuscation!").unwrap()
    }

    #[test]
    fn every_method_round_trips_every_size() {
        let codecs = set();
        for method in Method::ALL {
            for size in [0usize, 1, 4096, 1 << 20] {
                let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
                let env = codecs.obfuscate(&data, method.as_str()).unwrap();
                assert_eq!(env.method, method.as_str());
                let wire = env.to_bytes().unwrap();
                let back = Envelope::from_bytes(&wire).unwrap();
                assert_eq!(codecs.deobfuscate(&back).unwrap(), data, "{method} {size}");
            }
        }
    }

    #[test]
    fn unknown_method_on_seal_falls_back_to_base64() {
        let env = set().obfuscate(b"abc", "rot13").unwrap();
        assert_eq!(env.method, "base64");
    }

    #[test]
    fn unknown_method_on_open_is_strict_or_lenient() {
        let codecs = set();
        let mut env = codecs.obfuscate(b"abc", "base64").unwrap();
        env.method = "rot13".into();
        assert!(matches!(
            codecs.deobfuscate(&env),
            Err(CodecError::UnknownMethod(m)) if m == "rot13"
        ));
        assert_eq!(codecs.deobfuscate_lenient(&env).unwrap(), b"abc");
    }

    #[test]
    fn lenient_open_still_fails_closed_on_tamper() {
        let codecs = set();
        let mut env = codecs.obfuscate(b"secret", "aes").unwrap();
        env.data[0] ^= 1;
        assert!(matches!(
            codecs.deobfuscate_lenient(&env),
            Err(CodecError::AuthenticationFailed)
        ));
    }

    #[test]
    fn frames_open_plain_or_sealed() {
        use crate::frame::FrameType;

        let codecs = set();
        let plain = Frame::new("p", FrameType::Pong, b"pong".to_vec());
        assert_eq!(codecs.open_frame(&plain).unwrap(), b"pong");

        let env = codecs.obfuscate(b"secret", "xor").unwrap();
        let mut sealed = Frame::new("s", FrameType::HttpRequest, env.to_bytes().unwrap());
        sealed.obfuscation_method = env.method.clone();
        assert_eq!(codecs.open_frame(&sealed).unwrap(), b"secret");

        sealed.payload = b"not an envelope".to_vec();
        assert!(matches!(
            codecs.open_frame(&sealed),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn method_names() {
        assert_eq!("aes-256-gcm".parse::<Method>().unwrap(), Method::Aes);
        assert!("nope".parse::<Method>().is_err());
        assert_eq!(Method::Xor.to_string(), "xor");
    }
}
