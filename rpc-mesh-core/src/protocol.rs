//! Protocol plug-point.
//!
//! Wire protocols (REST, gRPC, JSON-RPC, MQTT, custom) are a non-goal here
//! — this module only defines the capability trait a transport adapter
//! must implement, plus a `NoopProtocol` test double. Generalizes the
//! donor's `MessageCodec` (the one concrete codec it ships) into a trait
//! so real codecs live outside this crate as plug-ins.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;

/// A single outbound invocation handed to a protocol adapter after routing
/// and pooling have resolved a connection.
#[derive(Debug, Clone)]
pub struct ProtocolRequest {
    pub method: String,
    pub payload: Vec<u8>,
}

/// What a protocol adapter returns for one invocation.
#[derive(Debug, Clone)]
pub struct ProtocolResponse {
    pub payload: Vec<u8>,
}

/// Capability a transport adapter must provide: start/stop lifecycle plus
/// a single request/response invocation over an already-acquired channel.
/// Implementations own their own wire format; this crate never inspects
/// `payload` bytes.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Initializes any per-process resources (listeners, client pools).
    /// Called once before the first `invoke`.
    async fn start(&self) -> Result<()>;

    /// Releases resources acquired by `start`. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Sends `request` over `channel` and returns its response. `deadline`
    /// is the caller's per-attempt budget; implementations that do their
    /// own internal waiting (e.g. on a response queue) should respect it,
    /// though the common case is a single in-flight send/receive the
    /// caller already wraps in a timeout.
    async fn invoke(
        &self,
        channel: &mut dyn crate::connection::RawChannel,
        request: ProtocolRequest,
        deadline: Instant,
    ) -> Result<ProtocolResponse>;
}

/// A protocol handler that echoes the request payload back unchanged.
/// Used only in tests and examples where the wire format is irrelevant.
pub struct NoopProtocol;

#[async_trait]
impl ProtocolHandler for NoopProtocol {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        _channel: &mut dyn crate::connection::RawChannel,
        request: ProtocolRequest,
        _deadline: Instant,
    ) -> Result<ProtocolResponse> {
        Ok(ProtocolResponse {
            payload: request.payload,
        })
    }
}
