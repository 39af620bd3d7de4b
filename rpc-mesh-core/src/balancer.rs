//! Load balancing strategies for selecting one endpoint from a discovered set.
//!
//! Generalizes the donor's `ProtocolType::select_best` (pick the best of a
//! small static slice by priority) to a runtime-selectable strategy over
//! [`ServiceEndpoint`] lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use crate::error::{MeshError, Result};
use crate::types::ServiceEndpoint;

/// Named balancing strategy, selectable per target by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    RoundRobin,
    Random,
    LeastConnections,
}

impl BalancerKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "round-robin" | "round_robin" => Ok(BalancerKind::RoundRobin),
            "random" => Ok(BalancerKind::Random),
            "least-connections" | "least_connections" => Ok(BalancerKind::LeastConnections),
            other => Err(MeshError::bad_request(format!("unknown load balancer strategy '{other}'"))),
        }
    }
}

/// Selects one endpoint from a slice under a policy.
///
/// Empty input returns `Ok(None)`, not an error — there is simply nothing
/// to select among.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Result<Option<ServiceEndpoint>>;

    /// Called after a request against `endpoint_id` completes (success or
    /// failure). No-op for stateless strategies.
    fn record_completion(&self, _endpoint_id: &str) {}

    /// Called when a request against `endpoint_id` begins, for strategies
    /// that track in-flight counts.
    fn record_start(&self, _endpoint_id: &str) {}
}

/// Monotonic counter mod `len`, tie-broken by index. Fair over large windows.
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Result<Option<ServiceEndpoint>> {
        if endpoints.is_empty() {
            return Ok(None);
        }
        let idx = self.counter.fetch_add(1, Ordering::SeqCst) as usize % endpoints.len();
        Ok(Some(endpoints[idx].clone()))
    }
}

/// Uniform selection over `[0, len)`.
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for Random {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Result<Option<ServiceEndpoint>> {
        if endpoints.is_empty() {
            return Ok(None);
        }
        let idx = rand::random::<usize>() % endpoints.len();
        Ok(Some(endpoints[idx].clone()))
    }
}

/// Lowest in-flight count wins; ties go to the first endpoint encountered.
///
/// Per-entry counts are `AtomicI64`, matching §5's "least-connections
/// active-count map is atomic per entry" rather than a coarse lock over the
/// whole map. The map itself is guarded only for insertion of new entries.
pub struct LeastConnections {
    counts: StdMutex<HashMap<String, AtomicI64>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            counts: StdMutex::new(HashMap::new()),
        }
    }

    fn count_for(&self, id: &str) -> i64 {
        let guard = self.counts.lock().unwrap();
        guard.get(id).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }

    fn ensure_entry(&self, id: &str) {
        let mut guard = self.counts.lock().unwrap();
        guard.entry(id.to_string()).or_insert_with(|| AtomicI64::new(0));
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Result<Option<ServiceEndpoint>> {
        if endpoints.is_empty() {
            return Ok(None);
        }
        let chosen = endpoints
            .iter()
            .min_by_key(|e| self.count_for(&e.identity()))
            .cloned();
        if let Some(ref endpoint) = chosen {
            self.ensure_entry(&endpoint.identity());
        }
        Ok(chosen)
    }

    fn record_start(&self, endpoint_id: &str) {
        self.ensure_entry(endpoint_id);
        let guard = self.counts.lock().unwrap();
        if let Some(counter) = guard.get(endpoint_id) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_completion(&self, endpoint_id: &str) {
        let guard = self.counts.lock().unwrap();
        if let Some(counter) = guard.get(endpoint_id) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// RAII guard that calls `record_completion` on drop so panics and early
/// returns still decrement the in-flight count (Open Question: decrement
/// must happen on any completion path, not just the success path).
pub struct InFlightGuard<'a> {
    balancer: &'a dyn LoadBalancer,
    endpoint_id: String,
}

impl<'a> InFlightGuard<'a> {
    pub fn start(balancer: &'a dyn LoadBalancer, endpoint_id: impl Into<String>) -> Self {
        let endpoint_id = endpoint_id.into();
        balancer.record_start(&endpoint_id);
        Self { balancer, endpoint_id }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.balancer.record_completion(&self.endpoint_id);
    }
}

pub fn build(kind: BalancerKind) -> Box<dyn LoadBalancer> {
    match kind {
        BalancerKind::RoundRobin => Box::new(RoundRobin::new()),
        BalancerKind::Random => Box::new(Random::new()),
        BalancerKind::LeastConnections => Box::new(LeastConnections::new()),
    }
}
