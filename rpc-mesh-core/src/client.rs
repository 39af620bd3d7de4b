//! Client facade: composes retry, circuit breaker, router, connection
//! pooling, and the protocol/serializer plug-points into `Call`,
//! `CallAsync`, and `Stream`.
//!
//! Structurally this replaces the donor's `Client::connect` (one
//! `ConnectionManager` against a fixed host list, plus `AdminClient`/
//! `DataClient` wrappers) with one composition root over N routed
//! services; the `retry -> breaker -> route -> acquire -> invoke ->
//! release` call chain is the donor's `execute_with_retry` generalized
//! per-target rather than per-cluster.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::balancer::LoadBalancer;
use crate::circuit_breaker::{counts_as_breaker_failure, CircuitBreaker};
use crate::connection::ConnectFn;
use crate::connection_manager::ConnectionManager;
use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics::ObservabilityHook;
use crate::protocol::{ProtocolHandler, ProtocolRequest};
use crate::registry::Registry;
use crate::router::{InternalRequest, MessageRouter};
use crate::serializer::Serializer;
use crate::types::{CircuitBreakerConfig, PoolConfig, RetryPolicy};

/// A locally hosted handler, invoked when this process receives a call for
/// `name` rather than originates one. Generalizes the donor's "registered
/// services via dynamic reflection" (explicitly disallowed, spec §9) into
/// a single method-dispatch closure per service name.
pub type ServiceHandler =
    Arc<dyn Fn(String, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync>;

/// Wiring the facade needs beyond the raw stack, so plug-points (dial,
/// protocol, serializer, balancer) are supplied rather than hardcoded.
pub struct ClientConfig {
    pub retry_policy: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool: PoolConfig,
    /// Optional export hook for call/breaker/pool observations. Setting up
    /// a concrete backend (OTel, Prometheus) is out of scope for this
    /// crate; `None` means no hook is called.
    pub observability: Option<Arc<dyn ObservabilityHook>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            observability: None,
        }
    }
}

/// Entry point for outbound calls and local service registration.
///
/// State gates (spec §4.8): `start()` must run before any `call`;
/// `start()`/`shutdown()` are each idempotent; `start()` after
/// `shutdown()` fails. All three are enforced by a two-bit `AtomicBool`
/// pair rather than a single tri-state enum so `started()`/`stopped()`
/// checks never need a lock.
pub struct Client {
    router: Arc<MessageRouter>,
    connections: Arc<ConnectionManager>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
    retry_policy: RetryPolicy,
    protocol: Arc<dyn ProtocolHandler>,
    serializer: Arc<dyn Serializer>,
    handlers: RwLock<HashMap<String, ServiceHandler>>,
    started: AtomicBool,
    shutdown: AtomicBool,
    observability: Option<Arc<dyn ObservabilityHook>>,
}

impl Client {
    pub fn new(
        registry: Arc<dyn Registry>,
        balancer: Box<dyn LoadBalancer>,
        connect: ConnectFn,
        protocol: Arc<dyn ProtocolHandler>,
        serializer: Arc<dyn Serializer>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::new(MessageRouter::new(registry, balancer)),
            connections: ConnectionManager::new(config.pool, connect),
            breakers: RwLock::new(HashMap::new()),
            breaker_config: config.circuit_breaker,
            retry_policy: config.retry_policy,
            protocol,
            serializer,
            handlers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            observability: config.observability,
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Registers a local handler for inbound calls addressed to `name`.
    /// May be called before or after `start()`.
    pub async fn register_service(&self, name: impl Into<String>, handler: ServiceHandler) {
        self.handlers.write().await.insert(name.into(), handler);
    }

    /// Brings the client into a callable state. Idempotent; fails if
    /// `shutdown()` already ran.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(MeshError::internal("cannot start a client after shutdown"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.protocol.start().await?;
        info!("client started");
        Ok(())
    }

    /// Drains connection pools and stops the protocol handler. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connections.shutdown_gracefully(timeout).await;
        self.protocol.stop().await?;
        info!("client shut down");
        Ok(())
    }

    fn ensure_callable(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(MeshError::internal("client is shut down"));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(MeshError::internal("client has not been started"));
        }
        Ok(())
    }

    async fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let guard = self.breakers.read().await;
            if let Some(b) = guard.get(key) {
                return Arc::clone(b);
            }
        }
        let mut guard = self.breakers.write().await;
        if let Some(b) = guard.get(key) {
            return Arc::clone(b);
        }
        let breaker = Arc::new(CircuitBreaker::new(key.to_string(), self.breaker_config.clone()));
        guard.insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Blocking RPC: `retry(breaker(route -> acquire -> encode -> invoke ->
    /// decode -> release))`, per the spec's composition pseudocode.
    pub async fn call(&self, service: &str, method: &str, payload: Vec<u8>, deadline: Instant) -> Result<Vec<u8>> {
        self.ensure_callable()?;

        let request = InternalRequest {
            service: service.to_string(),
            method: method.to_string(),
            payload,
            metadata: HashMap::new(),
        };

        crate::retry::execute(&self.retry_policy, || self.call_once(&request, deadline)).await
    }

    /// Non-blocking variant: spawns `call` and hands back its `JoinHandle`
    /// as the future. Cancelling the returned handle cancels the call.
    pub fn call_async(
        self: &Arc<Self>,
        service: String,
        method: String,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> tokio::task::JoinHandle<Result<Vec<u8>>> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.call(&service, &method, payload, deadline).await })
    }

    /// Cold, producer-terminated stream of responses. The producer task
    /// stops when `deadline` expires or the receiver is dropped; neither
    /// side blocks the other mid-item.
    pub fn stream(
        self: &Arc<Self>,
        service: String,
        method: String,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> tokio::sync::mpsc::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let result = client.call(&service, &method, payload.clone(), deadline).await;
                let is_err = result.is_err();
                if tx.send(result).await.is_err() || is_err || Instant::now() >= deadline {
                    break;
                }
            }
        });
        rx
    }

    /// Runs one attempt: `breaker(route -> acquire -> encode -> invoke ->
    /// decode -> release)`, per the spec's composition pseudocode, which
    /// nests routing *inside* the breaker so a target whose routing or
    /// registry lookups keep failing still trips and gets fail-fasted.
    /// The breaker is keyed by the request's service name — the target the
    /// breaker governs — not by the endpoint the router eventually picks,
    /// since that endpoint isn't known until routing has already run.
    async fn call_once(&self, request: &InternalRequest, deadline: Instant) -> Result<Vec<u8>> {
        let breaker = self.breaker_for(&request.service).await;
        if !breaker.allow_request() {
            return Err(MeshError::service_unavailable(format!(
                "circuit breaker open for {}",
                request.service
            )));
        }

        let started = Instant::now();
        let outcome = async {
            let endpoint = self.router.route(request).await?;
            let lease = self.connections.acquire(&endpoint, deadline).await?;
            let encoded = self.serializer.encode(&request.payload)?;

            let invoke_result = {
                let mut conn = lease.slot.lock().await;
                let call = self.protocol.invoke(
                    conn.channel_mut(),
                    ProtocolRequest {
                        method: request.method.clone(),
                        payload: encoded,
                    },
                    deadline,
                );
                tokio::time::timeout_at(deadline, call).await.unwrap_or_else(|_| {
                    Err(MeshError::timeout(format!("protocol invoke timed out for {}", endpoint.identity())))
                })
            };

            self.connections.release(&endpoint, lease).await;
            if let Some(hook) = &self.observability {
                if let Some(stats) = self.connections.pool_stats(&endpoint).await {
                    hook.on_pool_stats(&endpoint.identity(), stats);
                }
            }
            let response = invoke_result?;
            self.serializer.decode(&response.payload)
        }
        .await;

        match &outcome {
            Ok(_) => breaker.record_success(),
            // Client errors mean the target answered and the caller was
            // wrong, not that the target is unhealthy.
            Err(err) if err.kind.is_client_error() => breaker.record_success(),
            Err(err) if counts_as_breaker_failure(err.kind) => breaker.record_failure(),
            Err(_) => {}
        }

        if let Some(hook) = &self.observability {
            hook.on_call_complete(&request.service, outcome.is_ok(), started.elapsed().as_secs_f64() * 1000.0);
            hook.on_circuit_state_change(&request.service, breaker.state());
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobin;
    use crate::connection::RawChannel;
    use crate::protocol::NoopProtocol;
    use crate::registry::memory::MemoryRegistry;
    use crate::serializer::JsonSerializer;
    use crate::types::ServiceInfo;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeChannel;
    impl RawChannel for FakeChannel {}

    fn connector() -> ConnectFn {
        Arc::new(|_endpoint, _timeout| Box::pin(async move { Ok(Box::new(FakeChannel) as Box<dyn RawChannel>) }))
    }

    async fn running_client() -> Arc<Client> {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        registry
            .register(ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001))
            .await
            .unwrap();

        let client = Client::new(
            registry,
            Box::new(RoundRobin::new()),
            connector(),
            Arc::new(NoopProtocol),
            Arc::new(JsonSerializer),
            ClientConfig::default(),
        );
        client.start().await.unwrap();
        client
    }

    #[tokio::test]
    async fn call_before_start_fails_internal_error() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        let client = Client::new(
            registry,
            Box::new(RoundRobin::new()),
            connector(),
            Arc::new(NoopProtocol),
            Arc::new(JsonSerializer),
            ClientConfig::default(),
        );

        let result = client.call("calc", "add", vec![1], Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn call_round_trips_payload_through_noop_protocol() {
        let client = running_client().await;
        let response = client
            .call("calc", "add", vec![1, 2, 3], Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_blocks_further_calls() {
        let client = running_client().await;
        client.start().await.unwrap();
        client.shutdown(Duration::from_secs(1)).await.unwrap();
        client.shutdown(Duration::from_secs(1)).await.unwrap();

        let result = client
            .call("calc", "add", vec![1], Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn start_after_shutdown_fails() {
        let client = running_client().await;
        client.shutdown(Duration::from_secs(1)).await.unwrap();
        let result = client.start().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn registered_handler_is_stored_for_inbound_dispatch() {
        let client = running_client().await;
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        client
            .register_service(
                "calc",
                Arc::new(move |_method, payload| {
                    let calls = Arc::clone(&calls_clone);
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(payload)
                    })
                }),
            )
            .await;

        let handlers = client.handlers.read().await;
        assert!(handlers.contains_key("calc"));
    }

    struct AlwaysFailsProtocol;
    #[async_trait]
    impl ProtocolHandler for AlwaysFailsProtocol {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn invoke(
            &self,
            _channel: &mut dyn RawChannel,
            _request: ProtocolRequest,
            _deadline: Instant,
        ) -> Result<crate::protocol::ProtocolResponse> {
            Err(MeshError::service_unavailable("target down"))
        }
    }

    #[tokio::test]
    async fn repeated_failures_trip_the_circuit_breaker_scenario_s4() {
        let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
        registry
            .register(ServiceInfo::new("svc-1", "calc", "10.0.0.1", 9001))
            .await
            .unwrap();

        let mut config = ClientConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout_ms: 60_000,
        };
        config.retry_policy = RetryPolicy::no_retry();

        let client = Client::new(
            registry,
            Box::new(RoundRobin::new()),
            connector(),
            Arc::new(AlwaysFailsProtocol),
            Arc::new(JsonSerializer),
            config,
        );
        client.start().await.unwrap();

        for _ in 0..2 {
            let _ = client.call("calc", "add", vec![1], Instant::now() + Duration::from_secs(1)).await;
        }

        let result = client.call("calc", "add", vec![1], Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ServiceUnavailable);
    }
}
