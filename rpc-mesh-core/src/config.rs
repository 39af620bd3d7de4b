//! Configuration surface (spec §6): `network.*`, `registry.*`,
//! `connectionPool.*`, `observability.logging.level`, assembled with
//! `default < file < env < remote` precedence (Testable Property 14).
//!
//! Structurally this generalizes the donor's `ConnectionConfig` (one flat
//! struct with `with_*` builder methods and a single `validate()`) into
//! one struct per section plus a `ConfigSource` merge pass, since the
//! spec's surface now covers four independently-overridable sections
//! rather than one connection descriptor.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub keep_alive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7000,
            max_connections: 100,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            keep_alive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryBackend {
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(rename = "type")]
    pub backend: RegistryBackend,
    pub endpoints: Vec<String>,
    pub namespace: String,
    pub ttl_secs: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            endpoints: Vec::new(),
            namespace: "default".to_string(),
            ttl_secs: 30,
            heartbeat_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    pub max: u32,
    pub min: u32,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max: 20,
            min: 5,
            idle_timeout_ms: 60_000,
            max_lifetime_ms: 1_800_000,
            connection_timeout_ms: 5_000,
        }
    }
}

impl From<&ConnectionPoolConfig> for crate::types::PoolConfig {
    fn from(cfg: &ConnectionPoolConfig) -> Self {
        crate::types::PoolConfig {
            max_connections: cfg.max,
            min_connections: cfg.min,
            idle_timeout_ms: cfg.idle_timeout_ms,
            max_lifetime_ms: cfg.max_lifetime_ms,
            connection_timeout_ms: cfg.connection_timeout_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
}

/// The full configuration surface, built up from `default < file < env <
/// remote` layers via [`MeshConfig::merge`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    pub connection_pool: ConnectionPoolConfig,
    pub observability: ObservabilityConfig,
}

impl MeshConfig {
    /// Validates cross-field invariants, failing fast with the offending
    /// key path in the message (spec §6).
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.connection_pool.min > self.connection_pool.max {
            return Err(MeshError::bad_request(format!(
                "connectionPool.min ({}) must not exceed connectionPool.max ({})",
                self.connection_pool.min, self.connection_pool.max
            )));
        }
        if self.network.port == 0 {
            return Err(MeshError::bad_request("network.port must be greater than 0"));
        }
        if self.registry.namespace.is_empty() {
            return Err(MeshError::bad_request("registry.namespace must not be empty"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.registry.heartbeat_interval_ms)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.ttl_secs)
    }
}

/// One layer in the precedence chain. Higher-precedence layers overwrite
/// keys present in lower ones; a layer with no opinion on a key is simply
/// absent from its map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    File = 1,
    Env = 2,
    Remote = 3,
}

/// Flat `a.b.c -> value` overlay, applied over a base [`MeshConfig`] in
/// ascending [`ConfigSource`] order. Values are strings; the target field's
/// parse is attempted and failures are reported with the key path.
#[derive(Debug, Default)]
pub struct ConfigOverlay {
    layers: Vec<(ConfigSource, HashMap<String, String>)>,
}

impl ConfigOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, source: ConfigSource, values: HashMap<String, String>) -> Self {
        self.layers.push((source, values));
        self
    }

    /// Reads `FRAMEWORK_A_B_C`-style environment variables and returns
    /// them as an `a.b.c`-keyed overlay layer (spec §6 env-override rule).
    pub fn from_env(prefix: &str) -> HashMap<String, String> {
        let screaming_prefix = format!("{}_", prefix.to_uppercase());
        std::env::vars()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&screaming_prefix)?;
                Some((rest.to_lowercase().replace('_', "."), value))
            })
            .collect()
    }

    /// Merges every layer over `base`, lowest precedence first, returning
    /// the assembled config. Unknown keys are ignored; type mismatches on
    /// a known key fail with that key's path.
    pub fn apply(mut self, mut base: MeshConfig) -> Result<MeshConfig, MeshError> {
        self.layers.sort_by_key(|(source, _)| *source);
        for (_, values) in self.layers {
            for (key, value) in values {
                apply_key(&mut base, &key, &value)?;
            }
        }
        Ok(base)
    }
}

fn apply_key(config: &mut MeshConfig, key: &str, value: &str) -> Result<(), MeshError> {
    let parse_u16 = |v: &str| v.parse::<u16>().map_err(|_| bad_key(key, v));
    let parse_u32 = |v: &str| v.parse::<u32>().map_err(|_| bad_key(key, v));
    let parse_u64 = |v: &str| v.parse::<u64>().map_err(|_| bad_key(key, v));
    let parse_bool = |v: &str| v.parse::<bool>().map_err(|_| bad_key(key, v));

    match key {
        "network.host" => config.network.host = value.to_string(),
        "network.port" => config.network.port = parse_u16(value)?,
        "network.maxconnections" | "network.max_connections" => config.network.max_connections = parse_u32(value)?,
        "network.readtimeout" | "network.read_timeout" => config.network.read_timeout_ms = parse_u64(value)?,
        "network.writetimeout" | "network.write_timeout" => config.network.write_timeout_ms = parse_u64(value)?,
        "network.keepalive" | "network.keep_alive" => config.network.keep_alive = parse_bool(value)?,
        "registry.namespace" => config.registry.namespace = value.to_string(),
        "registry.ttl" => config.registry.ttl_secs = parse_u64(value)?,
        "registry.heartbeatinterval" | "registry.heartbeat_interval" => {
            config.registry.heartbeat_interval_ms = parse_u64(value)?
        }
        "connectionpool.max" | "connection_pool.max" => config.connection_pool.max = parse_u32(value)?,
        "connectionpool.min" | "connection_pool.min" => config.connection_pool.min = parse_u32(value)?,
        "connectionpool.idletimeout" | "connection_pool.idle_timeout" => {
            config.connection_pool.idle_timeout_ms = parse_u64(value)?
        }
        "connectionpool.maxlifetime" | "connection_pool.max_lifetime" => {
            config.connection_pool.max_lifetime_ms = parse_u64(value)?
        }
        "connectionpool.connectiontimeout" | "connection_pool.connection_timeout" => {
            config.connection_pool.connection_timeout_ms = parse_u64(value)?
        }
        "observability.logging.level" => {
            config.observability.logging.level = match value.to_lowercase().as_str() {
                "debug" => LogLevel::Debug,
                "info" => LogLevel::Info,
                "warn" => LogLevel::Warn,
                "error" => LogLevel::Error,
                _ => return Err(bad_key(key, value)),
            }
        }
        _ => {}
    }
    Ok(())
}

fn bad_key(key: &str, value: &str) -> MeshError {
    MeshError::bad_request(format!("invalid value '{value}' for config key '{key}'"))
}
