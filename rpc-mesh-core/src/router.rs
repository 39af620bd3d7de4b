//! Translates an outbound request into a concrete [`ServiceEndpoint`] via
//! routing rules, registry lookup, and load balancing.
//!
//! Grounded on the donor's `ConnectionConfig.hosts` + `NodeId` indexing
//! idiom, generalized to rule-based dispatch. The routing table is read
//! through an `RwLock<Arc<RoutingTable>>` snapshot the same way the donor
//! keeps `node_health` behind `Arc<RwLock<HashMap<..>>>`, satisfying §5's
//! "reads may observe a slightly stale snapshot, monotonically advancing."

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::balancer::LoadBalancer;
use crate::error::{MeshError, Result};
use crate::registry::Registry;
use crate::types::{ServiceEndpoint, ServiceInfo};

/// An outbound call before an endpoint has been resolved.
#[derive(Debug, Clone)]
pub struct InternalRequest {
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// A priority-ordered predicate + target-resolver pair consulted before
/// generic name lookup. Higher `priority` wins; equal priority is
/// insertion-order stable (rules are evaluated in table order and the
/// table only ever appends within one priority band).
pub struct RoutingRule {
    pub name: String,
    pub priority: i32,
    pub matches: Box<dyn Fn(&InternalRequest) -> bool + Send + Sync>,
    /// Returns either a concrete service id (preferred, skips load
    /// balancing) or a service name (falls through to registry lookup).
    pub resolve_target: Box<dyn Fn(&InternalRequest) -> RuleTarget + Send + Sync>,
}

#[derive(Debug, Clone)]
pub enum RuleTarget {
    ServiceId(String),
    ServiceName(String),
}

/// The router's current view of discoverable services, refreshed by
/// `update_routing_table` or registry watch callbacks.
#[derive(Default)]
pub struct RoutingTable {
    by_name: HashMap<String, Vec<ServiceEndpoint>>,
}

impl RoutingTable {
    pub fn from_services(services: &[ServiceInfo]) -> Self {
        let mut by_name: HashMap<String, Vec<ServiceEndpoint>> = HashMap::new();
        for info in services {
            by_name.entry(info.name.clone()).or_default().push(ServiceEndpoint::from(info));
        }
        Self { by_name }
    }

    fn endpoints_for(&self, name: &str) -> Vec<ServiceEndpoint> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    fn endpoint_by_id(&self, id: &str) -> Option<ServiceEndpoint> {
        self.by_name.values().flatten().find(|e| e.service_id == id).cloned()
    }
}

/// Owns the routing table, rule list, registry, and balancer; resolves
/// requests to endpoints.
pub struct MessageRouter {
    rules: RwLock<Vec<RoutingRule>>,
    table: RwLock<Arc<RoutingTable>>,
    registry: Arc<dyn Registry>,
    balancer: Box<dyn LoadBalancer>,
}

impl MessageRouter {
    pub fn new(registry: Arc<dyn Registry>, balancer: Box<dyn LoadBalancer>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            table: RwLock::new(Arc::new(RoutingTable::default())),
            registry,
            balancer,
        }
    }

    /// Adds a rule, keeping the list sorted by descending priority with
    /// insertion order preserved among equal priorities.
    pub async fn add_rule(&self, rule: RoutingRule) {
        let mut rules = self.rules.write().await;
        let pos = rules.iter().position(|r| r.priority < rule.priority).unwrap_or(rules.len());
        rules.insert(pos, rule);
    }

    /// Replaces the routing table snapshot. Readers in flight keep using
    /// their already-cloned `Arc` until they next call `route`.
    pub async fn update_routing_table(&self, services: &[ServiceInfo]) {
        let table = Arc::new(RoutingTable::from_services(services));
        *self.table.write().await = table;
    }

    pub fn balancer(&self) -> &dyn LoadBalancer {
        self.balancer.as_ref()
    }

    /// Resolves `request` to a concrete endpoint: rules first (by
    /// descending priority, first match wins), then registry lookup by
    /// name, then load balancing.
    pub async fn route(&self, request: &InternalRequest) -> Result<ServiceEndpoint> {
        let target_name = {
            let rules = self.rules.read().await;
            let mut resolved: Option<RuleTarget> = None;
            for rule in rules.iter() {
                if (rule.matches)(request) {
                    resolved = Some((rule.resolve_target)(request));
                    break;
                }
            }
            match resolved {
                Some(RuleTarget::ServiceId(id)) => {
                    let table = Arc::clone(&*self.table.read().await);
                    if let Some(endpoint) = table.endpoint_by_id(&id) {
                        return Ok(endpoint);
                    }
                    // Fall through to name-based lookup using the request's
                    // own service name if the rule's id no longer resolves.
                    request.service.clone()
                }
                Some(RuleTarget::ServiceName(name)) => name,
                None => request.service.clone(),
            }
        };

        let endpoints = self.lookup(&target_name).await?;
        if endpoints.is_empty() {
            return Err(MeshError::service_unavailable(format!("no instances available for service '{target_name}'")));
        }

        self.balancer
            .select(&endpoints)?
            .ok_or_else(|| MeshError::routing(format!("load balancer produced no selection for '{target_name}'")))
    }

    async fn lookup(&self, name: &str) -> Result<Vec<ServiceEndpoint>> {
        let snapshot = Arc::clone(&*self.table.read().await);
        let cached = snapshot.endpoints_for(name);
        if !cached.is_empty() {
            return Ok(cached);
        }
        let discovered = self.registry.discover(&name.to_string(), None).await?;
        Ok(discovered.iter().map(ServiceEndpoint::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobin;
    use crate::registry::memory::MemoryRegistry;
    use crate::types::ServiceInfo;
    use std::time::Duration;

    fn request(service: &str) -> InternalRequest {
        InternalRequest {
            service: service.to_string(),
            method: "add".to_string(),
            payload: vec![],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn routes_by_name_via_registry_when_no_rule_matches() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        registry.register(ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001)).await.unwrap();

        let router = MessageRouter::new(registry, Box::new(RoundRobin::new()));
        let endpoint = router.route(&request("calc")).await.unwrap();
        assert_eq!(endpoint.service_id, "svc-1");
    }

    #[tokio::test]
    async fn empty_discovery_fails_service_unavailable() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        let router = MessageRouter::new(registry, Box::new(RoundRobin::new()));

        let result = router.route(&request("ghost")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        registry.register(ServiceInfo::new("svc-a", "calc", "10.0.0.1", 9001)).await.unwrap();
        registry.register(ServiceInfo::new("svc-b", "calc-v2", "10.0.0.2", 9002)).await.unwrap();

        let router = MessageRouter::new(registry, Box::new(RoundRobin::new()));
        router
            .add_rule(RoutingRule {
                name: "canary".to_string(),
                priority: 10,
                matches: Box::new(|req| req.metadata.get("canary").is_some()),
                resolve_target: Box::new(|_req| RuleTarget::ServiceName("calc-v2".to_string())),
            })
            .await;

        let mut req = request("calc");
        req.metadata.insert("canary".to_string(), "true".to_string());

        let endpoint = router.route(&req).await.unwrap();
        assert_eq!(endpoint.service_id, "svc-b");
    }

    #[tokio::test]
    async fn routing_table_update_is_used_before_registry_fallback() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        let router = MessageRouter::new(Arc::clone(&registry) as Arc<dyn Registry>, Box::new(RoundRobin::new()));

        router
            .update_routing_table(&[ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001)])
            .await;

        let endpoint = router.route(&request("calc")).await.unwrap();
        assert_eq!(endpoint.service_id, "svc-1");
    }
}
