//! Error types for the rpc-mesh core runtime
//!
//! This module defines the closed `ErrorKind` set and the `MeshError` type
//! that every public operation in the crate returns, along with the fixed
//! bidirectional mappings to HTTP, gRPC, and JSON-RPC error numbers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum depth of an error's causal chain before it is truncated.
pub const MAX_ERROR_CHAIN_DEPTH: usize = 10;

/// The closed set of failure kinds a `MeshError` can carry.
///
/// Each kind has a fixed framework code and fixed mappings to HTTP, gRPC,
/// and JSON-RPC error numbers (see the tables on the `to_*`/`from_*`
/// methods below).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller supplied malformed input.
    BadRequest,
    /// Caller is not authenticated.
    Unauthorized,
    /// Caller is authenticated but not permitted.
    Forbidden,
    /// No such service, method, or resource.
    NotFound,
    /// The operation did not complete before its deadline.
    Timeout,
    /// An unexpected failure internal to a handler or the framework.
    InternalError,
    /// The operation is recognized but not implemented.
    NotImplemented,
    /// The target is temporarily unable to serve requests.
    ServiceUnavailable,
    /// The wire protocol layer failed to frame or parse a message.
    ProtocolError,
    /// Encoding or decoding the payload failed.
    SerializationError,
    /// No route could be resolved for the request.
    RoutingError,
    /// Establishing or using a transport connection failed.
    ConnectionError,
}

impl ErrorKind {
    /// Returns true if a failure of this kind is safe to retry.
    ///
    /// Per spec: `Timeout | ServiceUnavailable | ConnectionError`.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ServiceUnavailable | ErrorKind::ConnectionError
        )
    }

    /// Returns true if the framework code falls in `[400, 500)`.
    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.code())
    }

    /// Returns true if the framework code falls in `[500, 600)`.
    pub fn is_server_error(self) -> bool {
        (500..600).contains(&self.code())
    }

    /// Returns true if the framework code falls in `[600, 700)`.
    pub fn is_framework_error(self) -> bool {
        (600..700).contains(&self.code())
    }

    /// The fixed framework numeric code for this kind.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::InternalError => 500,
            ErrorKind::NotImplemented => 501,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::ProtocolError => 600,
            ErrorKind::SerializationError => 601,
            ErrorKind::RoutingError => 602,
            ErrorKind::ConnectionError => 603,
        }
    }

    /// The human-readable kind name used in the standardized error response.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InternalError => "Internal Error",
            ErrorKind::NotImplemented => "Not Implemented",
            ErrorKind::ServiceUnavailable => "Service Unavailable",
            ErrorKind::ProtocolError => "Protocol Error",
            ErrorKind::SerializationError => "Serialization Error",
            ErrorKind::RoutingError => "Routing Error",
            ErrorKind::ConnectionError => "Connection Error",
        }
    }

    /// Maps to the HTTP status code a protocol boundary should emit.
    pub fn to_http(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::InternalError => 500,
            ErrorKind::NotImplemented => 501,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::ProtocolError => 502,
            ErrorKind::SerializationError => 400,
            ErrorKind::RoutingError => 502,
            ErrorKind::ConnectionError => 503,
        }
    }

    /// Recovers a kind from an HTTP status code.
    ///
    /// Only the standard codes in the spec's table round-trip exactly;
    /// anything else falls back to `InternalError`.
    pub fn from_http(code: u16) -> ErrorKind {
        match code {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            500 => ErrorKind::InternalError,
            501 => ErrorKind::NotImplemented,
            503 => ErrorKind::ServiceUnavailable,
            502 => ErrorKind::RoutingError,
            _ => ErrorKind::InternalError,
        }
    }

    /// Maps to the gRPC status code a protocol boundary should emit.
    pub fn to_grpc(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 3,
            ErrorKind::Unauthorized => 16,
            ErrorKind::Forbidden => 7,
            ErrorKind::NotFound => 5,
            ErrorKind::Timeout => 4,
            ErrorKind::InternalError => 13,
            ErrorKind::NotImplemented => 12,
            ErrorKind::ServiceUnavailable => 14,
            ErrorKind::ProtocolError => 13,
            ErrorKind::SerializationError => 13,
            ErrorKind::RoutingError => 13,
            ErrorKind::ConnectionError => 14,
        }
    }

    /// Recovers a kind from a gRPC status code.
    pub fn from_grpc(code: u16) -> ErrorKind {
        match code {
            3 => ErrorKind::BadRequest,
            16 => ErrorKind::Unauthorized,
            7 => ErrorKind::Forbidden,
            5 => ErrorKind::NotFound,
            4 => ErrorKind::Timeout,
            13 => ErrorKind::InternalError,
            12 => ErrorKind::NotImplemented,
            14 => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::InternalError,
        }
    }

    /// Maps to the JSON-RPC error number a protocol boundary should emit.
    pub fn to_json_rpc(self) -> i32 {
        match self {
            ErrorKind::BadRequest => -32600,
            ErrorKind::Unauthorized => -32603,
            ErrorKind::Forbidden => -32603,
            ErrorKind::NotFound => -32601,
            ErrorKind::Timeout => -32603,
            ErrorKind::InternalError => -32603,
            ErrorKind::NotImplemented => -32603,
            ErrorKind::ServiceUnavailable => -32603,
            ErrorKind::ProtocolError => -32603,
            ErrorKind::SerializationError => -32700,
            ErrorKind::RoutingError => -32603,
            ErrorKind::ConnectionError => -32603,
        }
    }

    /// Recovers a kind from a JSON-RPC error number.
    ///
    /// `-32603` is ambiguous in the forward mapping (many kinds collapse
    /// onto it); it recovers as `InternalError`, the most general of the
    /// kinds that produce it.
    pub fn from_json_rpc(code: i32) -> ErrorKind {
        match code {
            -32600 => ErrorKind::BadRequest,
            -32601 => ErrorKind::NotFound,
            -32700 => ErrorKind::SerializationError,
            -32603 => ErrorKind::InternalError,
            _ => ErrorKind::InternalError,
        }
    }
}

/// The framework-wide error type returned by every public operation.
///
/// Mirrors the donor SDK's `DatabaseError` in shape (named fields per
/// variant, `is_retryable`-style predicates) but is closed over the
/// spec's fixed `ErrorKind` set rather than an open per-domain enum.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("[{} {}] {message}", kind.code(), kind.name())]
pub struct MeshError {
    /// The classified kind of this failure.
    pub kind: ErrorKind,
    /// Operator-facing message.
    pub message: String,
    /// Optional additional detail.
    pub details: Option<String>,
    /// The service instance this error originated from, if known.
    pub service_id: Option<String>,
    /// Unix epoch milliseconds when the error was constructed.
    pub timestamp: i64,
    /// Causal chain, outermost-first, depth capped at `MAX_ERROR_CHAIN_DEPTH`.
    pub chain: Vec<String>,
}

impl MeshError {
    /// Builds a new error of the given kind with no cause chain yet.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            chain: vec![format!("[{} {}] {}", kind.code(), kind.name(), message)],
            message,
            details: None,
            service_id: None,
            timestamp: now_millis(),
        }
    }

    /// Attaches free-form detail.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attaches the originating service id.
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    /// Wraps a lower-level error as the cause of a new one, preserving the
    /// causal chain up to `MAX_ERROR_CHAIN_DEPTH` entries, outermost-first.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, cause: &MeshError) -> Self {
        let message = message.into();
        let mut chain = vec![format!("[{} {}] {}", kind.code(), kind.name(), message)];
        chain.extend(cause.chain.iter().cloned());
        chain.truncate(MAX_ERROR_CHAIN_DEPTH);
        Self {
            kind,
            message,
            details: None,
            service_id: cause.service_id.clone(),
            timestamp: now_millis(),
            chain,
        }
    }

    /// Returns true if this failure is safe to retry per policy.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns true if this failure's code falls in `[400, 500)`.
    pub fn is_client_error(&self) -> bool {
        self.kind.is_client_error()
    }

    /// Returns true if this failure's code falls in `[500, 600)`.
    pub fn is_server_error(&self) -> bool {
        self.kind.is_server_error()
    }

    /// Returns true if this failure's code falls in `[600, 700)`.
    pub fn is_framework_error(&self) -> bool {
        self.kind.is_framework_error()
    }

    /// Convenience constructors for each kind, matching the donor's
    /// per-variant constructor style (`DatabaseError::ConnectionTimeout { .. }`).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionError, message)
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RoutingError, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationError, message)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, MeshError>;

/// The standardized error response object emitted at any protocol boundary
/// (spec §6 / §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
    pub timestamp: i64,
    pub details: Option<String>,
    pub service_id: Option<String>,
    pub error_chain: Vec<String>,
}

impl From<&MeshError> for ErrorResponse {
    fn from(err: &MeshError) -> Self {
        Self {
            code: err.kind.code(),
            error: err.kind.name().to_string(),
            message: err.message.clone(),
            timestamp: err.timestamp,
            details: err.details.clone(),
            service_id: err.service_id.clone(),
            error_chain: err.chain.clone(),
        }
    }
}
