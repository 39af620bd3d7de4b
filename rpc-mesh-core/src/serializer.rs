//! Serialization plug-point.
//!
//! Wire formats (protobuf, msgpack, custom) are a non-goal here — this
//! module defines the capability trait a payload codec must implement,
//! operating on the already-opaque request/response bytes produced by
//! callers' own domain types, plus a `JsonSerializer` envelope used only
//! in tests. Grounded on the donor's `MessageCodec::encode`/`decode`
//! pairing (explicit error variants over a fixed byte representation),
//! generalized into a trait so the crate never needs a concrete codec.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Encodes/decodes the opaque payload bytes carried by an
/// [`crate::router::InternalRequest`] for transmission by a
/// [`crate::protocol::ProtocolHandler`]. Kept free of generics so it stays
/// object-safe — `Arc<dyn Serializer>` is what the client facade holds.
pub trait Serializer: Send + Sync {
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    data: Vec<u8>,
}

/// Wraps payload bytes in a JSON envelope. Used by tests and examples;
/// not a recommendation for production wire format.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        serde_json::to_vec(&JsonEnvelope { data: payload.to_vec() })
            .map_err(|e| MeshError::serialization(format!("json encode failed: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let envelope: JsonEnvelope =
            serde_json::from_slice(bytes).map_err(|e| MeshError::serialization(format!("json decode failed: {e}")))?;
        Ok(envelope.data)
    }
}
