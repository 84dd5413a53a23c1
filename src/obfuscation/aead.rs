//! AES-256-GCM codec.
//!
//! Each envelope gets a fresh random 96-bit nonce (`iv`) and carries the
//! 128-bit tag separately (`auth_tag`). Opening fails closed: if the tag does
//! not verify, the caller gets [`CodecError::AuthenticationFailed`] and
//! nothing else.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};

use super::{Codec, CodecError, Envelope, Method};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

pub struct AesGcmCodec {
    cipher: Aes256Gcm,
}

impl AesGcmCodec {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(hex: &str) -> Result<Self, CodecError> {
        let bytes = decode_hex(hex.trim())?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidKey("AES key must be 32 bytes".into()))?;
        Ok(Self::new(&key))
    }

    pub fn random() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }
}

impl Codec for AesGcmCodec {
    fn method(&self) -> Method {
        Method::Aes
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CodecError::Encryption)?;
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        let mut env = Envelope::new(Method::Aes, sealed);
        env.iv = Some(nonce.to_vec());
        env.auth_tag = Some(tag);
        Ok(env)
    }

    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let iv = envelope
            .iv
            .as_deref()
            .ok_or_else(|| CodecError::Malformed("missing iv".into()))?;
        let tag = envelope
            .auth_tag
            .as_deref()
            .ok_or_else(|| CodecError::Malformed("missing auth_tag".into()))?;
        if iv.len() != NONCE_SIZE {
            return Err(CodecError::Malformed(format!(
                "iv must be {NONCE_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(CodecError::AuthenticationFailed);
        }

        let mut sealed = Vec::with_capacity(envelope.data.len() + TAG_SIZE);
        sealed.extend_from_slice(&envelope.data);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| CodecError::AuthenticationFailed)
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CodecError> {
    if s.len() % 2 != 0 {
        return Err(CodecError::InvalidKey("odd-length hex".into()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => nibble(*hi)
                .zip(nibble(*lo))
                .map(|(hi, lo)| hi << 4 | lo)
                .ok_or_else(|| CodecError::InvalidKey("non-hex character".into())),
            _ => Err(CodecError::InvalidKey("odd-length hex".into())),
        })
        .collect()
}

fn nibble(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).map(|d| d as u8)
}
