//! Named-event wire format
//!
//! An envelope is the tag as a codec string followed by the payload bytes.
//! The payload is not escaped or prefixed: the transport delivers whole
//! envelopes (one per datagram, or one per length-prefixed stream frame).

use crate::codec::{Reader, Writer};
use crate::error::{LinkError, Result};

/// Tag plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    /// Serialize into a single frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_str(&self.tag).write_raw(&self.payload);
        w.finish()
    }

    /// Recover tag and payload from a frame produced by [`Envelope::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let tag = r
            .read_string()
            .ok_or_else(|| LinkError::Malformed("<envelope>".to_string()))?;
        let payload = r.read_rest().unwrap_or_default().to_vec();
        Ok(Self { tag, payload })
    }
}
