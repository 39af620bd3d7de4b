//! `endpoint -> ConnectionPool` orchestration, plus cross-pool lifecycle.
//!
//! Generalizes the donor's `ConnectionManager` (one pool across a fixed host
//! list, `node_health: Arc<RwLock<HashMap<NodeId, NodeHealth>>>`) to one pool
//! per endpoint, created lazily on first use and keyed by endpoint identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::connection::{ConnectFn, ConnectionPool, Lease, PoolStats};
use crate::error::{ErrorKind, MeshError, Result};
use crate::types::{PoolConfig, ServiceEndpoint};

/// Maps endpoints to their connection pools, creating pools lazily.
pub struct ConnectionManager {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    eviction_handles: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    config: PoolConfig,
    connect: ConnectFn,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig, connect: ConnectFn) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            eviction_handles: RwLock::new(HashMap::new()),
            config,
            connect,
        })
    }

    async fn pool_for(&self, endpoint: &ServiceEndpoint) -> Result<Arc<ConnectionPool>> {
        let key = endpoint.identity();
        {
            let guard = self.pools.read().await;
            if let Some(pool) = guard.get(&key) {
                return Ok(Arc::clone(pool));
            }
        }
        let mut guard = self.pools.write().await;
        if let Some(pool) = guard.get(&key) {
            return Ok(Arc::clone(pool));
        }
        let pool = ConnectionPool::new(endpoint.clone(), self.config.clone(), Arc::clone(&self.connect))?;
        let handle = pool.spawn_eviction_task();
        self.eviction_handles.write().await.insert(key.clone(), handle);
        guard.insert(key, Arc::clone(&pool));
        info!(endpoint = %pool.endpoint().identity(), "opened connection pool");
        Ok(pool)
    }

    /// Acquires a connection for `endpoint`, creating its pool on first use.
    pub async fn acquire(&self, endpoint: &ServiceEndpoint, deadline: Instant) -> Result<Lease> {
        let pool = self.pool_for(endpoint).await?;
        pool.acquire(deadline).await
    }

    /// Releases `lease` back to `endpoint`'s pool.
    pub async fn release(&self, endpoint: &ServiceEndpoint, lease: Lease) {
        let pool = {
            let guard = self.pools.read().await;
            guard.get(&endpoint.identity()).cloned()
        };
        if let Some(pool) = pool {
            pool.release(lease).await;
        }
    }

    /// Closes the pool for one endpoint, if it exists.
    pub async fn close_connections(&self, endpoint: &ServiceEndpoint) {
        let key = endpoint.identity();
        let pool = self.pools.write().await.remove(&key);
        if let Some(handle) = self.eviction_handles.write().await.remove(&key) {
            handle.abort();
        }
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    /// Closes every pool immediately (does not wait for drain).
    pub async fn close_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        for handle in self.eviction_handles.write().await.drain().map(|(_, h)| h) {
            handle.abort();
        }
        for pool in pools {
            pool.close().await;
        }
    }

    /// Signals every pool to drain, waiting up to `timeout`. Pools that
    /// don't finish draining in time are force-closed; returns how many
    /// were force-closed.
    pub async fn shutdown_gracefully(&self, timeout: Duration) -> usize {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().await.values().cloned().collect();
        let mut forced = 0usize;
        for pool in pools {
            match tokio::time::timeout(timeout, pool.close()).await {
                Ok(()) => {}
                Err(_) => {
                    warn!(endpoint = %pool.endpoint().identity(), "pool did not drain in time, forcing close");
                    forced += 1;
                }
            }
        }
        self.close_all().await;
        forced
    }

    /// Observation-only snapshot for one endpoint's pool.
    pub async fn pool_stats(&self, endpoint: &ServiceEndpoint) -> Option<PoolStats> {
        let guard = self.pools.read().await;
        match guard.get(&endpoint.identity()) {
            Some(pool) => Some(pool.stats().await),
            None => None,
        }
    }

    /// Best-effort sum of per-pool stats across all endpoints.
    pub async fn total_stats(&self) -> PoolStats {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().await.values().cloned().collect();
        let mut total = PoolStats::default();
        for pool in pools {
            let stats = pool.stats().await;
            total.total += stats.total;
            total.active += stats.active;
            total.idle += stats.idle;
        }
        total
    }
}

/// Wraps [`ConnectionManager`] with reconnect-on-failure backoff: delays
/// `1s, 2s, 4s, ...` capped at 30s, up to `max_reconnect_attempts`.
/// Attempts carry the caller's original deadline.
pub struct LifecycleManager {
    inner: Arc<ConnectionManager>,
    max_reconnect_attempts: u32,
}

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

impl LifecycleManager {
    pub fn new(inner: Arc<ConnectionManager>, max_reconnect_attempts: u32) -> Self {
        Self {
            inner,
            max_reconnect_attempts,
        }
    }

    /// Acquires a connection, retrying with exponential backoff
    /// (`1s, 2s, 4s, ... capped at 30s`) on `ConnectionError`.
    pub async fn acquire_with_retry(&self, endpoint: &ServiceEndpoint, deadline: Instant) -> Result<Lease> {
        let mut attempt = 0u32;
        loop {
            match self.inner.acquire(endpoint, deadline).await {
                Ok(lease) => return Ok(lease),
                Err(err) if err.kind == ErrorKind::ConnectionError && attempt < self.max_reconnect_attempts => {
                    attempt += 1;
                    let delay = reconnect_delay(attempt);
                    let now = Instant::now();
                    if now + delay >= deadline {
                        return Err(MeshError::wrap(
                            ErrorKind::Timeout,
                            format!("reconnect backoff would exceed deadline for {}", endpoint.identity()),
                            &err,
                        ));
                    }
                    warn!(endpoint = %endpoint.identity(), attempt, delay_ms = delay.as_millis() as u64, "reconnecting after connection error");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let scaled = RECONNECT_BASE_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(scaled.min(RECONNECT_MAX_DELAY.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::connection::RawChannel;

    struct FakeChannel;
    impl RawChannel for FakeChannel {}

    fn endpoint(id: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            service_id: id.into(),
            service_name: "calc".into(),
            address: id.into(),
            port: 9000,
            protocol: "grpc".into(),
            metadata: StdHashMap::new(),
        }
    }

    fn always_succeeds_connector() -> ConnectFn {
        Arc::new(|_e, _t| Box::pin(async move { Ok(Box::new(FakeChannel) as Box<dyn RawChannel>) }))
    }

    #[tokio::test]
    async fn pools_created_lazily_per_endpoint() {
        let mgr = ConnectionManager::new(PoolConfig::default(), always_succeeds_connector());
        let ep_a = endpoint("a");
        let ep_b = endpoint("b");

        assert!(mgr.pool_stats(&ep_a).await.is_none());
        let lease = mgr.acquire(&ep_a, Instant::now() + Duration::from_secs(1)).await.unwrap();
        mgr.release(&ep_a, lease).await;

        assert!(mgr.pool_stats(&ep_a).await.is_some());
        assert!(mgr.pool_stats(&ep_b).await.is_none());
    }

    #[tokio::test]
    async fn close_all_clears_every_pool() {
        let mgr = ConnectionManager::new(PoolConfig::default(), always_succeeds_connector());
        let ep = endpoint("a");
        let lease = mgr.acquire(&ep, Instant::now() + Duration::from_secs(1)).await.unwrap();
        mgr.release(&ep, lease).await;

        mgr.close_all().await;
        assert!(mgr.pool_stats(&ep).await.is_none());
    }

    #[tokio::test]
    async fn lifecycle_manager_retries_on_connection_error_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let connect: ConnectFn = Arc::new(move |_e, _t| {
            let attempts = Arc::clone(&attempts_clone);
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(MeshError::connection("dial refused"))
                } else {
                    Ok(Box::new(FakeChannel) as Box<dyn RawChannel>)
                }
            })
        });

        let inner = ConnectionManager::new(PoolConfig::default(), connect);
        let lifecycle = LifecycleManager::new(inner, 5);
        let ep = endpoint("a");

        let result = lifecycle.acquire_with_retry(&ep, Instant::now() + Duration::from_secs(10)).await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reconnect_delay_follows_fixed_schedule_capped_at_30s() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));
    }
}
