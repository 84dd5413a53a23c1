//! Identity codec: the envelope's base64 encoding is the only transform.

use super::{Codec, CodecError, Envelope, Method};

#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Codec;

impl Codec for Base64Codec {
    fn method(&self) -> Method {
        Method::Base64
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CodecError> {
        Ok(Envelope::new(Method::Base64, plaintext.to_vec()))
    }

    fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(envelope.data.clone())
    }
}
