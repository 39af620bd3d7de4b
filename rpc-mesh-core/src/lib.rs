//! rpc-mesh-core
//!
//! Core runtime for a polyglot service-communication framework: a service
//! registry, a request router, per-endpoint connection pooling, and a
//! resilience layer (retry + circuit breaker), composed behind a single
//! [`client::Client`] facade.
//!
//! Wire codecs, concrete serialization formats, and transport security
//! (TLS, auth) are plug-points, not concerns of this crate — see
//! [`protocol::ProtocolHandler`] and [`serializer::Serializer`].
//!
//! # Example
//!
//! ```ignore
//! use rpc_mesh_core::{Client, ClientConfig};
//! use rpc_mesh_core::balancer::RoundRobin;
//! use rpc_mesh_core::protocol::NoopProtocol;
//! use rpc_mesh_core::serializer::JsonSerializer;
//! use rpc_mesh_core::registry::memory::MemoryRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_secs(5));
//!     let client = Client::new(
//!         registry,
//!         Box::new(RoundRobin::new()),
//!         Arc::new(|_endpoint, _timeout| unimplemented!("wire dial is a plug-point")),
//!         Arc::new(NoopProtocol),
//!         Arc::new(JsonSerializer),
//!         ClientConfig::default(),
//!     );
//!     client.start().await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod router;
pub mod serializer;
pub mod types;

pub use balancer::{BalancerKind, LeastConnections, LoadBalancer, Random, RoundRobin};
pub use circuit_breaker::{CircuitBreaker, State as CircuitBreakerState};
pub use client::{Client, ClientConfig, ServiceHandler};
pub use config::{ConfigOverlay, ConfigSource, MeshConfig};
pub use connection::{ConnectionPool, ConnectionState, Lease, ManagedConnection, PoolStats, RawChannel};
pub use connection_manager::{ConnectionManager, LifecycleManager};
pub use error::{ErrorKind, ErrorResponse, MeshError};
pub use metrics::{ClientMetrics, MetricsCollector, ObservabilityHook};
pub use protocol::{NoopProtocol, ProtocolHandler, ProtocolRequest, ProtocolResponse};
pub use registry::{memory::MemoryRegistry, Registry, WatchHandle};
pub use router::{InternalRequest, MessageRouter, RoutingRule, RuleTarget};
pub use serializer::{JsonSerializer, Serializer};
pub use types::*;

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;
