//! Packets exchanged over channels
//!
//! A packet is a tag plus an opaque payload. The session layer only ever puts
//! integers and strings in control packets; both are encoded as JSON so the
//! transport's built-in reductions (Sum) can read them back.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::tags::Tag;

/// Errors decoding a packet payload
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Packet with tag {tag} has an empty payload")]
    Empty { tag: Tag },

    #[error("Packet with tag {tag} has a malformed payload: {source}")]
    Malformed {
        tag: Tag,
        #[source]
        source: serde_json::Error,
    },
}

/// A tagged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A packet with no payload
    pub fn empty(tag: Tag) -> Self {
        Self { tag, payload: Vec::new() }
    }

    /// A packet carrying a signed integer
    pub fn int(tag: Tag, value: i64) -> Self {
        Self {
            tag,
            payload: value.to_string().into_bytes(),
        }
    }

    /// A packet carrying a string
    pub fn text(tag: Tag, value: &str) -> Self {
        Self::json(tag, &value)
    }

    /// A packet carrying any serializable value
    pub fn json<T: Serialize + ?Sized>(tag: Tag, value: &T) -> Self {
        // Serializing plain data into a Vec cannot fail
        let payload = serde_json::to_vec(value).unwrap_or_default();
        Self { tag, payload }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the payload as an integer
    pub fn as_int(&self) -> Result<i64, PacketError> {
        self.decode()
    }

    /// Decode the payload as a string
    pub fn as_text(&self) -> Result<String, PacketError> {
        self.decode()
    }

    /// Decode the payload as any deserializable value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        if self.payload.is_empty() {
            return Err(PacketError::Empty { tag: self.tag });
        }
        serde_json::from_slice(&self.payload).map_err(|source| PacketError::Malformed { tag: self.tag, source })
    }
}
