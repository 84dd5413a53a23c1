//! Repeating-key XOR stream.
//!
//! Offers no real confidentiality; it only changes the byte-frequency profile
//! of the payload. Envelopes carry a short key fingerprint so a peer holding
//! a different key fails loudly instead of producing garbage.

use sha2::{Digest, Sha256};

use super::{Codec, CodecError, Envelope, Method};

/// Key used when none is configured.
pub const DEFAULT_XOR_KEY: &str = "default-32-byte-key-for-xor-obfuscation!";

pub struct XorCodec {
    key: Vec<u8>,
    key_hash: String,
}

impl XorCodec {
    /// An empty key falls back to [`DEFAULT_XOR_KEY`].
    pub fn new(key: &[u8]) -> Self {
        let key = if key.is_empty() {
            DEFAULT_XOR_KEY.as_bytes().to_vec()
        } else {
            key.to_vec()
        };
        let key_hash = key_fingerprint(&key);
        Self { key, key_hash }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Codec for XorCodec {
    fn method(&self) -> Method {
        Method::Xor
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CodecError> {
        let mut env = Envelope::new(Method::Xor, self.apply(plaintext));
        env.key_hash = Some(self.key_hash.clone());
        Ok(env)
    }

    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        if let Some(hash) = &envelope.key_hash {
            if *hash != self.key_hash {
                return Err(CodecError::KeyMismatch(hash.clone()));
            }
        }
        Ok(self.apply(&envelope.data))
    }
}

/// First 8 hex chars of SHA-256 over the key.
fn key_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    digest[..4].iter().fold(String::with_capacity(8), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciphertext_differs_and_round_trips() {
        let codec = XorCodec::new(b"k3y");
        let env = codec.seal(b"hello world").unwrap();
        assert_ne!(env.data, b"hello world");
        assert_eq!(env.key_hash.as_deref().map(str::len), Some(8));
        assert_eq!(codec.open(&env).unwrap(), b"hello world");
    }

    #[test]
    fn other_key_is_rejected_by_fingerprint() {
        let env = XorCodec::new(b"one").seal(b"data").unwrap();
        assert!(matches!(
            XorCodec::new(b"two").open(&env),
            Err(CodecError::KeyMismatch(_))
        ));
    }

    #[test]
    fn empty_key_uses_default() {
        let a = XorCodec::new(b"");
        let b = XorCodec::new(DEFAULT_XOR_KEY.as_bytes());
        assert_eq!(a.seal(b"x").unwrap().data, b.seal(b"x").unwrap().data);
    }
}
