//! In-memory [`Registry`] implementation: a map plus a TTL-expiry
//! background task. Suitable for tests and single-process deployments;
//! behaviorally equivalent to [`super::etcd::EtcdRegistry`] for every
//! operation on the trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use super::{Registry, WatchHandle};
use crate::error::{MeshError, Result};
use crate::types::{now_millis, HealthStatus, ServiceId, ServiceInfo, ServiceName, Timestamp};

struct Entry {
    info: ServiceInfo,
    expires_at: Timestamp,
}

type Callback = Box<dyn Fn(Vec<ServiceInfo>) + Send + Sync>;

struct PerNameWatch {
    subscribers: Arc<StdMutex<HashMap<u64, Callback>>>,
    notify: Arc<Notify>,
    dispatcher: JoinHandle<()>,
}

/// An in-memory, process-local registry.
///
/// Liveness is tracked with a lease expiry timestamp per instance; a
/// background task sweeps expired leases every `sweep_interval`.
pub struct MemoryRegistry {
    namespace: String,
    ttl_ms: u64,
    instances: Arc<RwLock<HashMap<ServiceId, Entry>>>,
    watches: Arc<RwLock<HashMap<ServiceName, PerNameWatch>>>,
    next_subscriber_id: AtomicU64,
    reaper: JoinHandle<()>,
}

impl MemoryRegistry {
    /// Creates a registry with the given lease TTL, reaped every
    /// `sweep_interval`.
    pub fn new(namespace: impl Into<String>, ttl: Duration, sweep_interval: Duration) -> Arc<Self> {
        let instances: Arc<RwLock<HashMap<ServiceId, Entry>>> = Arc::new(RwLock::new(HashMap::new()));
        let watches: Arc<RwLock<HashMap<ServiceName, PerNameWatch>>> = Arc::new(RwLock::new(HashMap::new()));

        let reap_instances = Arc::clone(&instances);
        let reap_watches = Arc::clone(&watches);
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let now = now_millis();
                let mut expired_names = Vec::new();
                {
                    let mut guard = reap_instances.write().await;
                    let before: Vec<ServiceName> = guard.values().map(|e| e.info.name.clone()).collect();
                    guard.retain(|_, entry| entry.expires_at > now);
                    let after: Vec<ServiceName> = guard.values().map(|e| e.info.name.clone()).collect();
                    for name in before {
                        if !after.contains(&name) && !expired_names.contains(&name) {
                            expired_names.push(name);
                        }
                    }
                }
                for name in expired_names {
                    notify_watchers(&reap_watches, &name).await;
                }
            }
        });

        Arc::new(Self {
            namespace: namespace.into(),
            ttl_ms: ttl.as_millis() as u64,
            instances,
            watches,
            next_subscriber_id: AtomicU64::new(0),
            reaper,
        })
    }

    /// The etcd-style storage key for an instance: `namespace/name/id`.
    pub fn key(&self, name: &str, id: &str) -> String {
        format!("{}/{}/{}", self.namespace, name, id)
    }

    async fn snapshot_healthy(&self, name: &ServiceName, version: Option<&str>) -> Vec<ServiceInfo> {
        let now = now_millis();
        let guard = self.instances.read().await;
        guard
            .values()
            .filter(|e| e.info.name == *name)
            .filter(|e| e.expires_at > now)
            .filter(|e| e.info.health_status == HealthStatus::Healthy)
            .filter(|e| version.map_or(true, |v| e.info.version == v))
            .map(|e| e.info.clone())
            .collect()
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn notify_watchers(watches: &Arc<RwLock<HashMap<ServiceName, PerNameWatch>>>, name: &ServiceName) {
    let guard = watches.read().await;
    if let Some(watch) = guard.get(name) {
        watch.notify.notify_one();
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, mut info: ServiceInfo) -> Result<()> {
        info.validate()?;
        info.health_status = HealthStatus::Healthy;
        info.registered_at = now_millis();
        let name = info.name.clone();
        let expires_at = now_millis() + self.ttl_ms as i64;
        let id = info.id.clone();
        {
            let mut guard = self.instances.write().await;
            guard.insert(id, Entry { info, expires_at });
        }
        notify_watchers(&self.watches, &name).await;
        Ok(())
    }

    async fn deregister(&self, id: &ServiceId) -> Result<()> {
        let name = {
            let mut guard = self.instances.write().await;
            guard.remove(id).map(|e| e.info.name)
        };
        if let Some(name) = name {
            notify_watchers(&self.watches, &name).await;
        }
        Ok(())
    }

    async fn heartbeat(&self, id: &ServiceId) -> Result<()> {
        let mut guard = self.instances.write().await;
        match guard.get_mut(id) {
            Some(entry) if entry.expires_at > now_millis() => {
                entry.expires_at = now_millis() + self.ttl_ms as i64;
                Ok(())
            }
            _ => Err(MeshError::not_found(format!("no live lease for service id {id}"))),
        }
    }

    async fn discover(&self, name: &ServiceName, version: Option<&str>) -> Result<Vec<ServiceInfo>> {
        Ok(self.snapshot_healthy(name, version).await)
    }

    async fn update_health_status(&self, id: &ServiceId, status: HealthStatus) -> Result<()> {
        let name = {
            let mut guard = self.instances.write().await;
            match guard.get_mut(id) {
                Some(entry) => {
                    entry.info.health_status = status;
                    Some(entry.info.name.clone())
                }
                None => None,
            }
        };
        match name {
            Some(name) => {
                notify_watchers(&self.watches, &name).await;
                Ok(())
            }
            None => Err(MeshError::not_found(format!("no such service id {id}"))),
        }
    }

    async fn watch(
        &self,
        name: ServiceName,
        callback: Box<dyn Fn(Vec<ServiceInfo>) + Send + Sync>,
    ) -> Result<WatchHandle> {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut guard = self.watches.write().await;
            if !guard.contains_key(&name) {
                let subscribers: Arc<StdMutex<HashMap<u64, Callback>>> = Arc::new(StdMutex::new(HashMap::new()));
                let notify = Arc::new(Notify::new());
                let dispatch_subscribers = Arc::clone(&subscribers);
                let dispatch_notify = Arc::clone(&notify);
                let dispatch_instances = Arc::clone(&self.instances);
                let dispatch_name = name.clone();
                let dispatcher = tokio::spawn(async move {
                    loop {
                        dispatch_notify.notified().await;
                        let now = now_millis();
                        let list: Vec<ServiceInfo> = {
                            let guard = dispatch_instances.read().await;
                            guard
                                .values()
                                .filter(|e| e.info.name == dispatch_name)
                                .filter(|e| e.expires_at > now)
                                .filter(|e| e.info.health_status == HealthStatus::Healthy)
                                .map(|e| e.info.clone())
                                .collect()
                        };
                        // Serialized: one task per name, callbacks invoked
                        // sequentially within this loop iteration.
                        let subs = dispatch_subscribers.lock().unwrap();
                        for cb in subs.values() {
                            cb(list.clone());
                        }
                    }
                });
                guard.insert(
                    name.clone(),
                    PerNameWatch {
                        subscribers,
                        notify,
                        dispatcher,
                    },
                );
            }
        }

        let (current, subscribers) = {
            let guard = self.watches.read().await;
            let watch = guard.get(&name).expect("just inserted");
            watch.subscribers.lock().unwrap().insert(subscriber_id, callback);
            (self.snapshot_healthy(&name, None).await, Arc::clone(&watch.subscribers))
        };
        if let Some(cb) = subscribers.lock().unwrap().get(&subscriber_id) {
            cb(current);
        }

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = cancel_rx.await;
            subscribers.lock().unwrap().remove(&subscriber_id);
        });

        Ok(WatchHandle::new(cancel_tx))
    }

    async fn close(&self) -> Result<()> {
        self.reaper.abort();
        let mut watches = self.watches.write().await;
        for (_, watch) in watches.drain() {
            watch.dispatcher.abort();
        }
        let mut instances = self.instances.write().await;
        instances.clear();
        Ok(())
    }
}
