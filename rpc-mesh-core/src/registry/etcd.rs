//! etcd-backed [`Registry`] implementation.
//!
//! Key layout: `<namespace>/<serviceName>/<serviceId> -> json(ServiceInfo)`.
//! Lease TTL is in seconds; watch prefix is `<namespace>/<serviceName>/`.
//! Network faults against the backend surface as `ServiceUnavailable`.
//!
//! Bring-your-own `etcd_client::Client`, following the same pattern as the
//! `ninelives-etcd` companion crate's `EtcdSink` (construct from an
//! already-connected client rather than owning connection setup).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions, WatchOptions};
use tokio::sync::Mutex as AsyncMutex;

use super::{Registry, WatchHandle};
use crate::error::{MeshError, Result};
use crate::types::{HealthStatus, ServiceId, ServiceInfo, ServiceName};

/// A registry backed by an etcd cluster via an already-connected client.
pub struct EtcdRegistry {
    namespace: String,
    ttl_secs: i64,
    client: AsyncMutex<Client>,
    /// Leases this handle owns, so `close` can revoke them on shutdown.
    owned_leases: AsyncMutex<HashMap<ServiceId, i64>>,
}

impl EtcdRegistry {
    pub fn new(namespace: impl Into<String>, ttl: Duration, client: Client) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            ttl_secs: ttl.as_secs().max(1) as i64,
            client: AsyncMutex::new(client),
            owned_leases: AsyncMutex::new(HashMap::new()),
        })
    }

    fn key(&self, name: &str, id: &str) -> String {
        format!("{}/{}/{}", self.namespace, name, id)
    }

    fn watch_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.namespace, name)
    }

    fn unreachable(context: &str, cause: impl std::fmt::Display) -> MeshError {
        MeshError::service_unavailable(format!("etcd backend unreachable during {context}"))
            .with_details(cause.to_string())
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, mut info: ServiceInfo) -> Result<()> {
        info.validate()?;
        info.health_status = HealthStatus::Healthy;
        info.registered_at = crate::types::now_millis();

        let mut client = self.client.lock().await;
        let lease = client
            .lease_grant(self.ttl_secs, None)
            .await
            .map_err(|e| Self::unreachable("lease_grant", e))?;

        let value = serde_json::to_vec(&info).map_err(|e| MeshError::serialization(e.to_string()))?;
        let key = self.key(&info.name, &info.id);
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
            .await
            .map_err(|e| Self::unreachable("put", e))?;

        drop(client);
        self.owned_leases.lock().await.insert(info.id.clone(), lease.id());
        Ok(())
    }

    async fn deregister(&self, id: &ServiceId) -> Result<()> {
        // Deregistration is driven by lease revocation; the id->lease map
        // is this handle's only record of which key the id lives under,
        // matching the spec's "idempotent — removing an unknown id
        // returns success."
        let lease_id = self.owned_leases.lock().await.remove(id);
        if let Some(lease_id) = lease_id {
            let mut client = self.client.lock().await;
            client
                .lease_revoke(lease_id)
                .await
                .map_err(|e| Self::unreachable("lease_revoke", e))?;
        }
        Ok(())
    }

    async fn heartbeat(&self, id: &ServiceId) -> Result<()> {
        let lease_id = {
            let guard = self.owned_leases.lock().await;
            *guard
                .get(id)
                .ok_or_else(|| MeshError::not_found(format!("no live lease for service id {id}")))?
        };
        let mut client = self.client.lock().await;
        client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|_| MeshError::not_found(format!("lease for service id {id} has already expired")))?;
        Ok(())
    }

    async fn discover(&self, name: &ServiceName, version: Option<&str>) -> Result<Vec<ServiceInfo>> {
        let mut client = self.client.lock().await;
        let prefix = self.watch_prefix(name);
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Self::unreachable("get", e))?;

        let mut result = Vec::new();
        for kv in response.kvs() {
            let info: ServiceInfo =
                serde_json::from_slice(kv.value()).map_err(|e| MeshError::serialization(e.to_string()))?;
            if info.health_status != HealthStatus::Healthy {
                continue;
            }
            if let Some(v) = version {
                if info.version != v {
                    continue;
                }
            }
            result.push(info);
        }
        Ok(result)
    }

    async fn update_health_status(&self, id: &ServiceId, status: HealthStatus) -> Result<()> {
        // The key is `namespace/name/id`; names aren't indexed by id alone,
        // so the current record is located by scanning the namespace prefix
        // rather than a direct key lookup.
        let mut client = self.client.lock().await;
        let prefix = format!("{}/", self.namespace);
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Self::unreachable("get", e))?;

        for kv in response.kvs() {
            let mut info: ServiceInfo = match serde_json::from_slice(kv.value()) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if &info.id != id {
                continue;
            }
            info.health_status = status;
            let value = serde_json::to_vec(&info).map_err(|e| MeshError::serialization(e.to_string()))?;
            let key = self.key(&info.name, &info.id);
            let lease_id = self.owned_leases.lock().await.get(id).copied();
            let mut put_options = PutOptions::new();
            if let Some(lease_id) = lease_id {
                put_options = put_options.with_lease(lease_id);
            }
            client
                .put(key, value, Some(put_options))
                .await
                .map_err(|e| Self::unreachable("put", e))?;
            return Ok(());
        }
        Err(MeshError::not_found(format!("no such service id {id}")))
    }

    async fn watch(
        &self,
        name: ServiceName,
        callback: Box<dyn Fn(Vec<ServiceInfo>) + Send + Sync>,
    ) -> Result<WatchHandle> {
        let mut client = self.client.lock().await;
        let prefix = self.watch_prefix(&name);
        let (mut watcher, mut stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Self::unreachable("watch", e))?;
        let mut poll_client = client.clone();
        drop(client);

        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => {
                        match message {
                            Ok(Some(_resp)) => {
                                // Re-query the full healthy-instance list on
                                // every event rather than forwarding only this
                                // batch's events, matching the in-memory
                                // registry's full-list watch contract.
                                let healthy = match poll_client
                                    .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
                                    .await
                                {
                                    Ok(response) => response
                                        .kvs()
                                        .iter()
                                        .filter_map(|kv| serde_json::from_slice::<ServiceInfo>(kv.value()).ok())
                                        .filter(|info: &ServiceInfo| info.health_status == HealthStatus::Healthy)
                                        .collect(),
                                    Err(_) => Vec::new(),
                                };
                                callback(healthy);
                            }
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(WatchHandle::new(cancel_tx))
    }

    async fn close(&self) -> Result<()> {
        let leases: Vec<i64> = self.owned_leases.lock().await.values().copied().collect();
        let mut client = self.client.lock().await;
        for lease_id in leases {
            let _ = client.lease_revoke(lease_id).await;
        }
        self.owned_leases.lock().await.clear();
        Ok(())
    }
}
