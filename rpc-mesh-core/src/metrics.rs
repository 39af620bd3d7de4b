//! Metrics: per-target RPC call latency/success tracking and per-pool
//! connection stats, plus an [`ObservabilityHook`] callers can implement to
//! export into a concrete backend.
//!
//! Generalizes the donor's `MetricsCollector` (one `OperationTracker` per
//! fixed operation kind — query/execute/transaction/auth) to one tracker
//! per call target, since this crate routes to N named services rather
//! than one database cluster. `Percentiles`/`OperationMetrics`/
//! `ConnectionMetrics` keep the donor's shape unchanged. Exporting to a
//! concrete tracer/metrics backend is the spec's non-goal (§1); this
//! module only calls hook points, mirroring the `ProtocolHandler`/
//! `Serializer` plug-point language.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::circuit_breaker::State as CircuitState;
use crate::connection::PoolStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Default for Percentiles {
    fn default() -> Self {
        Self {
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub total_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub percentiles: Percentiles,
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self {
            total_count: 0,
            success_count: 0,
            error_count: 0,
            min_latency_ms: f64::MAX,
            max_latency_ms: 0.0,
            avg_latency_ms: 0.0,
            percentiles: Percentiles::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
}

impl From<PoolStats> for ConnectionMetrics {
    fn from(stats: PoolStats) -> Self {
        Self {
            active_connections: stats.active,
            idle_connections: stats.idle,
            total_connections: stats.total,
        }
    }
}

/// A full snapshot: per-target call metrics plus per-target connection
/// metrics, keyed by the same identity (service name for calls, endpoint
/// identity for pools).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMetrics {
    pub call_metrics: HashMap<String, OperationMetrics>,
    pub connection_metrics: HashMap<String, ConnectionMetrics>,
}

#[derive(Debug)]
struct OperationTracker {
    total_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    latencies: RwLock<Vec<f64>>,
}

const MAX_RETAINED_LATENCIES: usize = 1000;

impl OperationTracker {
    fn new() -> Self {
        Self {
            total_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies: RwLock::new(Vec::new()),
        }
    }

    async fn record(&self, success: bool, latency_ms: f64) {
        self.total_count.fetch_add(1, Ordering::SeqCst);
        if success {
            self.success_count.fetch_add(1, Ordering::SeqCst);
        } else {
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }

        let mut latencies = self.latencies.write().await;
        latencies.push(latency_ms);
        if latencies.len() > MAX_RETAINED_LATENCIES {
            let excess = latencies.len() - MAX_RETAINED_LATENCIES;
            latencies.drain(0..excess);
        }
    }

    async fn snapshot(&self) -> OperationMetrics {
        let total_count = self.total_count.load(Ordering::SeqCst);
        let success_count = self.success_count.load(Ordering::SeqCst);
        let error_count = self.error_count.load(Ordering::SeqCst);

        let latencies = self.latencies.read().await;
        if latencies.is_empty() {
            return OperationMetrics {
                total_count,
                success_count,
                error_count,
                ..Default::default()
            };
        }

        let min_latency_ms = latencies.iter().copied().fold(f64::MAX, f64::min);
        let max_latency_ms = latencies.iter().copied().fold(0.0, f64::max);
        let avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;

        let mut sorted = latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let percentile = |p: f64| sorted.get((sorted.len() as f64 * p) as usize).copied().unwrap_or(0.0);

        OperationMetrics {
            total_count,
            success_count,
            error_count,
            min_latency_ms,
            max_latency_ms,
            avg_latency_ms,
            percentiles: Percentiles {
                p50: percentile(0.50),
                p95: percentile(0.95),
                p99: percentile(0.99),
            },
        }
    }
}

/// Tracks one [`OperationTracker`] per call target and one
/// [`ConnectionMetrics`] snapshot per pool.
pub struct MetricsCollector {
    call_trackers: RwLock<HashMap<String, Arc<OperationTracker>>>,
    connection_metrics: RwLock<HashMap<String, ConnectionMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            call_trackers: RwLock::new(HashMap::new()),
            connection_metrics: RwLock::new(HashMap::new()),
        }
    }

    async fn tracker_for(&self, target: &str) -> Arc<OperationTracker> {
        {
            let guard = self.call_trackers.read().await;
            if let Some(tracker) = guard.get(target) {
                return Arc::clone(tracker);
            }
        }
        let mut guard = self.call_trackers.write().await;
        Arc::clone(guard.entry(target.to_string()).or_insert_with(|| Arc::new(OperationTracker::new())))
    }

    /// Records one completed call against `target` (a service name or
    /// endpoint identity).
    pub async fn record_call(&self, target: &str, success: bool, latency_ms: f64) {
        self.tracker_for(target).await.record(success, latency_ms).await;
    }

    /// Replaces the connection metrics snapshot for `target`.
    pub async fn update_connection_metrics(&self, target: &str, stats: PoolStats) {
        self.connection_metrics.write().await.insert(target.to_string(), stats.into());
    }

    pub async fn get_metrics(&self) -> ClientMetrics {
        let call_trackers = self.call_trackers.read().await;
        let mut call_metrics = HashMap::with_capacity(call_trackers.len());
        for (target, tracker) in call_trackers.iter() {
            call_metrics.insert(target.clone(), tracker.snapshot().await);
        }

        ClientMetrics {
            call_metrics,
            connection_metrics: self.connection_metrics.read().await.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Observation hook points a caller can implement to export into a
/// concrete metrics/tracing backend. Setting up that backend (an OTel
/// exporter, a Prometheus registry) is out of scope for this crate — it
/// only calls these, mirroring `ProtocolHandler`/`Serializer`.
pub trait ObservabilityHook: Send + Sync {
    fn on_call_complete(&self, _target: &str, _success: bool, _latency_ms: f64) {}
    fn on_circuit_state_change(&self, _target: &str, _state: CircuitState) {}
    fn on_pool_stats(&self, _target: &str, _stats: PoolStats) {}
}

/// The default hook: logs transitions via `tracing` the way the donor
/// logs auth/connect/health events, without exporting anywhere.
pub struct TracingObservabilityHook;

impl ObservabilityHook for TracingObservabilityHook {
    fn on_call_complete(&self, target: &str, success: bool, latency_ms: f64) {
        if success {
            info!(target = %target, latency_ms, "call completed");
        } else {
            warn!(target = %target, latency_ms, "call failed");
        }
    }

    fn on_circuit_state_change(&self, target: &str, state: CircuitState) {
        warn!(target = %target, ?state, "circuit breaker state changed");
    }

    fn on_pool_stats(&self, target: &str, stats: PoolStats) {
        info!(target = %target, total = stats.total, active = stats.active, idle = stats.idle, "pool stats");
    }
}
