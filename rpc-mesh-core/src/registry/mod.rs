//! Service registry: a durable directory of `ServiceInfo` keyed by
//! `(namespace, name, id)`, with TTL-based liveness and change subscriptions.
//!
//! Two implementations share this contract: [`memory::MemoryRegistry`] for
//! tests and single-process deployments, and [`etcd::EtcdRegistry`] (behind
//! the `etcd` feature) for a distributed backend. Both must be
//! behaviorally indistinguishable for the operations below.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{HealthStatus, ServiceId, ServiceInfo, ServiceName};

/// A live subscription to a watched service name.
///
/// Dropping or calling [`WatchHandle::cancel`] releases the subscription;
/// after cancellation no further callbacks fire for it.
pub struct WatchHandle {
    cancel_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl WatchHandle {
    pub(crate) fn new(cancel_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Cancels the subscription. Idempotent.
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A durable directory of service instances with lease-based liveness.
///
/// Implementors must serialize watch callbacks per watched name (§5: "no
/// concurrent callbacks for the same name") while allowing callbacks for
/// different names to run in parallel.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Validates and stores `info`, binds a lease with the configured TTL,
    /// marks the instance `HEALTHY`, and notifies watchers of `info.name`.
    ///
    /// Fails `BadRequest` on invalid fields, `ServiceUnavailable` if the
    /// backing store is unreachable.
    async fn register(&self, info: ServiceInfo) -> Result<()>;

    /// Removes the binding for `id` and cancels its lease. Idempotent:
    /// removing an unknown id returns success. Notifies watchers.
    async fn deregister(&self, id: &ServiceId) -> Result<()>;

    /// Refreshes the lease for `id`. Must be called at an interval
    /// strictly less than the TTL. Fails `NotFound` if the lease already
    /// expired.
    async fn heartbeat(&self, id: &ServiceId) -> Result<()>;

    /// Returns all healthy, lease-live instances of `name`, optionally
    /// filtered by `version`. Ordering is unspecified.
    async fn discover(&self, name: &ServiceName, version: Option<&str>) -> Result<Vec<ServiceInfo>>;

    /// Out-of-band health override.
    async fn update_health_status(&self, id: &ServiceId, status: HealthStatus) -> Result<()>;

    /// Subscribes to `name`. On every add/remove/health-change the
    /// callback is invoked with the current healthy-instance list.
    async fn watch(
        &self,
        name: ServiceName,
        callback: Box<dyn Fn(Vec<ServiceInfo>) + Send + Sync>,
    ) -> Result<WatchHandle>;

    /// Cancels all leases owned by this handle and terminates watch streams.
    async fn close(&self) -> Result<()>;
}
