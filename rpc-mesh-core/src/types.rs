//! Core data types shared across the registry, router, pool, and resilience
//! layers.
//!
//! Generalizes the donor SDK's `NodeId`/`ConnectionConfig`/`PoolConfig`/
//! `RetryConfig` (which already model one connection pool against one
//! database cluster) to `ServiceInfo`/`PoolConfig`/`RetryPolicy` describing
//! N named services behind a registry.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Unique identifier of one running service instance.
pub type ServiceId = String;

/// Logical (possibly multi-instance) service name.
pub type ServiceName = String;

/// Unix epoch milliseconds.
pub type Timestamp = i64;

pub(crate) fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Health state of a registered service instance.
///
/// An instance is discoverable iff `HEALTHY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// Wire-protocol tag a service instance advertises support for.
///
/// The core never interprets these beyond comparison and ordering; actual
/// codecs are plugged in via the `ProtocolHandler` capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Rest,
    JsonRpc,
    WebSocket,
    Mqtt,
    Grpc,
    Custom(String),
}

/// A service instance descriptor, the unit the registry stores.
///
/// `id` uniquely identifies one running instance; `name` may have many
/// ids. Created by the caller, inserted by `register`, reaped on lease
/// expiry, explicit `deregister`, or process exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub name: ServiceName,
    pub version: String,
    pub language: String,
    pub address: String,
    pub port: u16,
    pub protocols: Vec<Protocol>,
    pub metadata: HashMap<String, String>,
    pub registered_at: Timestamp,
    /// Not part of the wire record; tracked alongside it by the registry.
    #[serde(skip)]
    pub health_status: HealthStatus,
}

impl ServiceInfo {
    /// Builds a new instance descriptor with `registered_at` stamped now
    /// and health left `Unknown` until `register` marks it `Healthy`.
    pub fn new(
        id: impl Into<ServiceId>,
        name: impl Into<ServiceName>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            language: String::new(),
            address: address.into(),
            port,
            protocols: Vec::new(),
            metadata: HashMap::new(),
            registered_at: now_millis(),
            health_status: HealthStatus::Unknown,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validates the fields `register` requires to be well-formed.
    pub fn validate(&self) -> Result<(), crate::error::MeshError> {
        if self.id.is_empty() {
            return Err(crate::error::MeshError::bad_request("service id must not be empty"));
        }
        if self.name.is_empty() {
            return Err(crate::error::MeshError::bad_request("service name must not be empty"));
        }
        if self.address.is_empty() {
            return Err(crate::error::MeshError::bad_request("service address must not be empty"));
        }
        if self.port == 0 {
            return Err(crate::error::MeshError::bad_request("service port must be greater than 0"));
        }
        Ok(())
    }
}

/// The router's view of a `ServiceInfo`: derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub service_id: ServiceId,
    pub service_name: ServiceName,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub metadata: HashMap<String, String>,
}

impl ServiceEndpoint {
    pub fn identity(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl From<&ServiceInfo> for ServiceEndpoint {
    fn from(info: &ServiceInfo) -> Self {
        let protocol = info
            .protocols
            .first()
            .map(|p| match p {
                Protocol::Rest => "rest".to_string(),
                Protocol::JsonRpc => "json-rpc".to_string(),
                Protocol::WebSocket => "websocket".to_string(),
                Protocol::Mqtt => "mqtt".to_string(),
                Protocol::Grpc => "grpc".to_string(),
                Protocol::Custom(name) => name.clone(),
            })
            .unwrap_or_default();
        Self {
            service_id: info.id.clone(),
            service_name: info.name.clone(),
            address: info.address.clone(),
            port: info.port,
            protocol,
            metadata: info.metadata.clone(),
        }
    }
}

/// Connection pool configuration for one endpoint.
///
/// Directly generalizes the donor's `PoolConfig` (`min_connections`,
/// `max_connections`, `connection_timeout_ms`, `idle_timeout_ms`,
/// `max_lifetime_ms`) with the spec's additional knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub connection_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub keep_alive: bool,
    pub tcp_nodelay: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            idle_timeout_ms: 60_000,
            max_lifetime_ms: 1_800_000,
            connection_timeout_ms: 5_000,
            health_check_interval_ms: 30_000,
            keep_alive: true,
            tcp_nodelay: true,
        }
    }
}

impl PoolConfig {
    /// Validates `0 <= min_connections <= max_connections`.
    pub fn validate(&self) -> Result<(), crate::error::MeshError> {
        if self.min_connections > self.max_connections {
            return Err(crate::error::MeshError::bad_request(format!(
                "connectionPool.min ({}) must not exceed connectionPool.max ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Immutable retry configuration, an exact structural generalization of
/// the donor's `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub retryable_error_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            retryable_error_kinds: vec![
                ErrorKind::Timeout,
                ErrorKind::ServiceUnavailable,
                ErrorKind::ConnectionError,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            retryable_error_kinds: Vec::new(),
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// The delay before attempt `attempt` (0-indexed, counting the retry
    /// number rather than the absolute attempt), per spec §4.6/§8 P9:
    /// `delay[i] = min(initialDelay * multiplier^i, maxDelay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let scaled = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay_ms as f64);
        std::time::Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_info_validates_required_fields() {
        let info = ServiceInfo::new("", "calc", "10.0.0.1", 9001);
        assert!(info.validate().is_err());

        let info = ServiceInfo::new("svc-1", "calc", "10.0.0.1", 0);
        assert!(info.validate().is_err());

        let info = ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn pool_config_rejects_min_over_max() {
        let cfg = PoolConfig {
            min_connections: 10,
            max_connections: 5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_policy_backoff_matches_spec_formula() {
        let policy = RetryPolicy::new(3, 100, 5000, 2.0);
        assert_eq!(policy.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 400);
    }

    #[test]
    fn retry_policy_caps_at_max_delay() {
        let policy = RetryPolicy::new(10, 1000, 5000, 2.0);
        assert_eq!(policy.delay_for_attempt(10).as_millis(), 5000);
    }

    #[test]
    fn service_endpoint_derives_from_service_info() {
        let info = ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001)
            .with_protocols(vec![Protocol::Grpc]);
        let endpoint = ServiceEndpoint::from(&info);
        assert_eq!(endpoint.service_id, "svc-1");
        assert_eq!(endpoint.protocol, "grpc");
    }
}
