//! Per-endpoint connection pooling.
//!
//! Generalizes the donor's `PooledConnection`/`ConnectionPool` (one pool,
//! implicitly keyed by a list of database hosts) to `ManagedConnection`/
//! `ConnectionPool` bound to a single [`ServiceEndpoint`], with the donor's
//! `total_connections` counter replaced by a `tokio::sync::Semaphore` so
//! `acquire` can wait with a deadline instead of polling.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::time::Instant;

use crate::error::{MeshError, Result};
use crate::types::{now_millis, PoolConfig, ServiceEndpoint, Timestamp};

/// An opaque, framework-owned raw transport handle.
///
/// The core never interprets the bytes it carries; actual wire protocols
/// are a non-goal plugged in via `ProtocolHandler`. `is_healthy` lets the
/// eviction sweep discover transport-level death (e.g. a dropped socket)
/// without the pool knowing the transport's shape.
pub trait RawChannel: Send + Sync {
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens a new raw channel to `endpoint`, subject to `connection_timeout`.
pub type ConnectFn =
    Arc<dyn Fn(ServiceEndpoint, Duration) -> Pin<Box<dyn Future<Output = Result<Box<dyn RawChannel>>> + Send>> + Send + Sync>;

/// `ManagedConnection`'s lifecycle. `Closed` is terminal and absorbing:
/// once reached, the connection never re-enters the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Active,
    Closed,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A framework-owned wrapper around a raw transport with a defined state
/// machine: `Idle -> Active -> Idle -> Closed` (closed is terminal).
pub struct ManagedConnection {
    pub id: u64,
    pub endpoint: ServiceEndpoint,
    channel: Box<dyn RawChannel>,
    state: ConnectionState,
    created_at: Timestamp,
    last_used_at: Timestamp,
    active_request_count: u32,
}

impl ManagedConnection {
    fn new(endpoint: ServiceEndpoint, channel: Box<dyn RawChannel>) -> Self {
        let now = now_millis();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            endpoint,
            channel,
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            active_request_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn channel(&self) -> &dyn RawChannel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn RawChannel {
        self.channel.as_mut()
    }

    fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.active_request_count += 1;
        self.last_used_at = now_millis();
    }

    /// Decrements the in-flight count; transitions back to `Idle` once it
    /// reaches zero, unless the connection is already `Closed`.
    fn mark_released(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.active_request_count = self.active_request_count.saturating_sub(1);
        self.last_used_at = now_millis();
        if self.active_request_count == 0 {
            self.state = ConnectionState::Idle;
        }
    }

    fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn is_idle_expired(&self, idle_timeout_ms: u64) -> bool {
        self.state == ConnectionState::Idle && (now_millis() - self.last_used_at) as u64 > idle_timeout_ms
    }

    fn is_lifetime_expired(&self, max_lifetime_ms: u64) -> bool {
        (now_millis() - self.created_at) as u64 > max_lifetime_ms
    }

    fn is_healthy(&self) -> bool {
        self.state != ConnectionState::Closed && self.channel.is_healthy()
    }
}

/// A connection acquired from the pool; releasing is explicit via
/// [`ConnectionPool::release`] rather than `Drop`, matching the donor's
/// explicit `return_connection` idiom (callers may need to inspect the
/// connection's final state — e.g. for logging — after release decides
/// whether it re-enters the idle set).
pub struct Lease {
    pub slot: Arc<Mutex<ManagedConnection>>,
}

/// Bounds a set of warm transports to one endpoint; multiplexes callers
/// over them and garbage-collects dead/old connections.
pub struct ConnectionPool {
    endpoint: ServiceEndpoint,
    config: PoolConfig,
    connect: ConnectFn,
    connections: RwLock<VecDeque<Arc<Mutex<ManagedConnection>>>>,
    permits: Arc<Semaphore>,
    draining: std::sync::atomic::AtomicBool,
    drain_notify: Arc<Notify>,
}

impl ConnectionPool {
    pub fn new(endpoint: ServiceEndpoint, config: PoolConfig, connect: ConnectFn) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_connections as usize)),
            endpoint,
            config,
            connect,
            connections: RwLock::new(VecDeque::new()),
            draining: std::sync::atomic::AtomicBool::new(false),
            drain_notify: Arc::new(Notify::new()),
        }))
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Selects an idle healthy connection, opening a new one if under
    /// `maxConnections`, waiting (bounded by `deadline`) otherwise. Fails
    /// `Timeout` if no connection is available before `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> Result<Lease> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(MeshError::service_unavailable(format!(
                "connection pool for {} is draining",
                self.endpoint.identity()
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let permit = tokio::time::timeout(remaining, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| MeshError::timeout(format!("acquire timed out for endpoint {}", self.endpoint.identity())))?
            .map_err(|_| MeshError::internal("connection pool semaphore closed unexpectedly"))?;
        // The permit is intentionally leaked into the lease's lifetime via
        // forgetting it here: the pool tracks capacity by `connections`
        // length, not permit count, once a connection exists; see release().
        permit.forget();

        {
            let mut guard = self.connections.write().await;
            if let Some(pos) = guard.iter().position(|c| {
                // Try-lock avoids blocking the whole pool on one busy slot.
                c.try_lock()
                    .map(|conn| conn.state() == ConnectionState::Idle && conn.is_healthy())
                    .unwrap_or(false)
            }) {
                let slot = guard.remove(pos).unwrap();
                guard.push_back(Arc::clone(&slot));
                drop(guard);
                {
                    let mut conn = slot.lock().await;
                    conn.mark_active();
                }
                return Ok(Lease { slot });
            }
        }

        let channel = tokio::time::timeout(remaining, (self.connect)(self.endpoint.clone(), remaining))
            .await
            .map_err(|_| MeshError::timeout(format!("dial timed out for endpoint {}", self.endpoint.identity())))??;

        let mut conn = ManagedConnection::new(self.endpoint.clone(), channel);
        conn.mark_active();
        let slot = Arc::new(Mutex::new(conn));
        self.connections.write().await.push_back(Arc::clone(&slot));
        Ok(Lease { slot })
    }

    /// Decrements the connection's in-flight count; does not block.
    pub async fn release(&self, lease: Lease) {
        {
            let mut conn = lease.slot.lock().await;
            conn.mark_released();
        }
        self.permits.add_permits(1);
    }

    /// Marks the pool draining; subsequent `acquire`s fail
    /// `ServiceUnavailable`. Idle connections close immediately; active
    /// ones are left to finish and close on release. Returns once every
    /// connection has reached `Closed`.
    pub async fn close(&self) {
        self.draining.store(true, Ordering::SeqCst);
        {
            let guard = self.connections.read().await;
            for slot in guard.iter() {
                let mut conn = slot.lock().await;
                if conn.state() == ConnectionState::Idle {
                    conn.close();
                }
            }
        }
        loop {
            let all_closed = {
                let guard = self.connections.read().await;
                let mut closed = true;
                for slot in guard.iter() {
                    let conn = slot.lock().await;
                    if conn.state() != ConnectionState::Closed {
                        closed = false;
                        break;
                    }
                }
                closed
            };
            if all_closed {
                break;
            }
            self.drain_notify.notified().await;
        }
    }

    /// Snapshot counts: `{total, active, idle}`. Never mutates pool state.
    pub async fn stats(&self) -> PoolStats {
        let guard = self.connections.read().await;
        let mut stats = PoolStats::default();
        for slot in guard.iter() {
            let conn = slot.lock().await;
            stats.total += 1;
            match conn.state() {
                ConnectionState::Active => stats.active += 1,
                ConnectionState::Idle => stats.idle += 1,
                ConnectionState::Closed => {}
            }
        }
        stats
    }

    /// Periodic maintenance: removes closed/unhealthy/idle-expired/
    /// lifetime-expired connections, keeping an idle floor of
    /// `minConnections`.
    pub async fn run_eviction_once(&self) {
        let mut guard = self.connections.write().await;
        let idle_count = {
            let mut count = 0usize;
            for slot in guard.iter() {
                if let Ok(conn) = slot.try_lock() {
                    if conn.state() == ConnectionState::Idle {
                        count += 1;
                    }
                }
            }
            count
        };

        let mut survivors = VecDeque::with_capacity(guard.len());
        let mut idle_remaining = idle_count;
        let mut any_closed_freed = 0u32;

        while let Some(slot) = guard.pop_front() {
            let mut conn = slot.lock().await;
            let was_active = conn.state() == ConnectionState::Active;

            if conn.state() == ConnectionState::Closed {
                any_closed_freed += 1;
                continue;
            }
            if !conn.channel.is_healthy() {
                if was_active {
                    // Defer: active connections close on release, not here.
                    drop(conn);
                    survivors.push_back(slot);
                    continue;
                }
                conn.close();
                any_closed_freed += 1;
                continue;
            }
            if conn.is_lifetime_expired(self.config.max_lifetime_ms) {
                if was_active {
                    // Defer: active connections close on release, not here.
                    drop(conn);
                    survivors.push_back(slot);
                    continue;
                }
                conn.close();
                any_closed_freed += 1;
                continue;
            }
            if conn.is_idle_expired(self.config.idle_timeout_ms) && idle_remaining > self.config.min_connections as usize {
                conn.close();
                idle_remaining = idle_remaining.saturating_sub(1);
                any_closed_freed += 1;
                continue;
            }

            drop(conn);
            survivors.push_back(slot);
        }

        *guard = survivors;
        drop(guard);

        if any_closed_freed > 0 {
            self.permits.add_permits(any_closed_freed as usize);
            self.drain_notify.notify_waiters();
        }
    }

    /// Spawns the periodic maintenance task at `healthCheckIntervalMs`.
    /// Returns a handle the owner should abort on pool teardown.
    pub fn spawn_eviction_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval_ms = self.config.health_check_interval_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                pool.run_eviction_once().await;
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u32,
    pub active: u32,
    pub idle: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    struct FakeChannel {
        healthy: Arc<AtomicBool>,
    }

    impl RawChannel for FakeChannel {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint {
            service_id: "svc-1".into(),
            service_name: "calc".into(),
            address: "10.0.0.1".into(),
            port: 9001,
            protocol: "grpc".into(),
            metadata: HashMap::new(),
        }
    }

    fn connector() -> ConnectFn {
        Arc::new(|_endpoint, _timeout| {
            Box::pin(async move {
                Ok(Box::new(FakeChannel {
                    healthy: Arc::new(AtomicBool::new(true)),
                }) as Box<dyn RawChannel>)
            })
        })
    }

    fn pool_config(max: u32, min: u32, idle_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            min_connections: min,
            idle_timeout_ms,
            max_lifetime_ms: 1_000_000,
            connection_timeout_ms: 1_000,
            health_check_interval_ms: 10_000,
            keep_alive: true,
            tcp_nodelay: true,
        }
    }

    #[tokio::test]
    async fn acquire_then_release_reuses_connection() {
        let pool = ConnectionPool::new(endpoint(), pool_config(5, 0, 50_000), connector()).unwrap();
        let lease = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        let first_id = lease.slot.lock().await.id;
        pool.release(lease).await;

        let lease2 = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease2.slot.lock().await.id, first_id);
        pool.release(lease2).await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn pool_bound_never_exceeded() {
        let pool = ConnectionPool::new(endpoint(), pool_config(2, 0, 50_000), connector()).unwrap();
        let l1 = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        let l2 = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();

        let result = pool.acquire(Instant::now() + Duration::from_millis(50)).await;
        assert!(result.is_err());

        pool.release(l1).await;
        pool.release(l2).await;
        let stats = pool.stats().await;
        assert!(stats.total <= 2);
    }

    #[tokio::test]
    async fn closed_connection_never_reacquired() {
        let pool = ConnectionPool::new(endpoint(), pool_config(1, 0, 50_000), connector()).unwrap();
        let lease = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        {
            let mut conn = lease.slot.lock().await;
            conn.close();
        }
        pool.release(lease).await;

        // The only slot is closed; acquire must dial a fresh connection
        // rather than ever handing back the closed one.
        let lease2 = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease2.slot.lock().await.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn idle_eviction_respects_min_floor_scenario_s5() {
        let pool = ConnectionPool::new(endpoint(), pool_config(5, 0, 50), connector()).unwrap();
        let lease = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        pool.release(lease).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.run_eviction_once().await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn state_machine_active_iff_request_count_positive() {
        let pool = ConnectionPool::new(endpoint(), pool_config(1, 0, 50_000), connector()).unwrap();
        let lease = pool.acquire(Instant::now() + Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.slot.lock().await.state(), ConnectionState::Active);
        pool.release(lease).await;
    }
}
