//! Opaque message envelope.
//!
//! A [`RawMessage`] holds the exact bytes of one protobuf message as it came
//! off the wire. Forwarding it re-emits those bytes untouched, so fields the
//! proxy has no schema for (including ones added by newer peers) survive the
//! trip. Resolvers that need a single value can peek it by field number
//! without decoding anything else.

use crate::error::WireError;
use bytes::{Buf, Bytes};
use prost::encoding::{self, DecodeContext, WireType};

/// One wire message, kept in its encoded form
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RawMessage {
    bytes: Bytes,
}

impl RawMessage {
    /// Wrap already-encoded message bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Encode a typed message into an envelope
    pub fn from_message<M: prost::Message>(message: &M) -> Self {
        Self::new(message.encode_to_vec())
    }

    /// Decode the envelope into a typed message.
    ///
    /// The proxy itself never does this; it exists for the service adapters
    /// and tests that sit at either end of a proxied call.
    pub fn decode<M: prost::Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.bytes.clone())?)
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the envelope, returning the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the message is empty (all fields at their defaults)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read a single `string` field by number.
    ///
    /// Every other field is skipped over without being interpreted. When the
    /// field occurs more than once the last occurrence wins, matching protobuf
    /// merge semantics for singular fields. Returns `Ok(None)` if the field is
    /// absent.
    pub fn peek_string(&self, field: u32) -> Result<Option<String>, WireError> {
        let mut buf = self.bytes.clone();
        let mut found = None;

        while buf.has_remaining() {
            let (tag, wire_type) = encoding::decode_key(&mut buf)?;
            if tag != field {
                encoding::skip_field(wire_type, tag, &mut buf, DecodeContext::default())?;
                continue;
            }
            if wire_type != WireType::LengthDelimited {
                return Err(WireError::FieldType { field, wire_type });
            }
            let mut value = String::new();
            encoding::string::merge(wire_type, &mut value, &mut buf, DecodeContext::default())?;
            found = Some(value);
        }

        Ok(found)
    }
}

impl From<Bytes> for RawMessage {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}
