//! End-to-end exercise of the `Client` facade: register -> start -> call ->
//! shutdown, wired against an in-memory registry and a fake transport
//! (wire transports and codecs are plug-points, not something this crate
//! ships a real implementation of — see `rpc_mesh_core::protocol`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rpc_mesh_core::balancer::RoundRobin;
use rpc_mesh_core::connection::{ConnectFn, RawChannel};
use rpc_mesh_core::protocol::NoopProtocol;
use rpc_mesh_core::registry::memory::MemoryRegistry;
use rpc_mesh_core::serializer::JsonSerializer;
use rpc_mesh_core::{Client, ClientConfig, ErrorKind, Registry, ServiceInfo};

struct FakeChannel;
impl RawChannel for FakeChannel {}

fn connector() -> ConnectFn {
    Arc::new(|_endpoint, _timeout| Box::pin(async move { Ok(Box::new(FakeChannel) as Box<dyn RawChannel>) }))
}

async fn registry_with_one_instance(name: &str) -> Arc<MemoryRegistry> {
    let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
    registry
        .register(ServiceInfo::new("svc-1", name, "10.0.0.1", 9001))
        .await
        .unwrap();
    registry
}

#[tokio::test]
async fn full_lifecycle_register_start_call_shutdown() {
    let registry = registry_with_one_instance("calc").await;
    let client = Client::new(
        registry,
        Box::new(RoundRobin::new()),
        connector(),
        Arc::new(NoopProtocol),
        Arc::new(JsonSerializer),
        ClientConfig::default(),
    );

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

    client.start().await.unwrap();

    let response = client
        .call("calc", "add", vec![1, 2, 3], Instant::now() + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response, vec![1, 2, 3]);

    client.shutdown(Duration::from_secs(1)).await.unwrap();

    let result = client.call("calc", "add", vec![1], Instant::now() + Duration::from_secs(1)).await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::InternalError);
}

#[tokio::test]
async fn call_async_completes_like_call() {
    let registry = registry_with_one_instance("calc").await;
    let client = Client::new(
        registry,
        Box::new(RoundRobin::new()),
        connector(),
        Arc::new(NoopProtocol),
        Arc::new(JsonSerializer),
        ClientConfig::default(),
    );
    client.start().await.unwrap();

    let handle = client.call_async("calc".to_string(), "add".to_string(), vec![9, 9], Instant::now() + Duration::from_secs(1));
    let response = handle.await.unwrap().unwrap();
    assert_eq!(response, vec![9, 9]);
}

#[tokio::test]
async fn stream_yields_repeated_responses_until_deadline() {
    let registry = registry_with_one_instance("calc").await;
    let client = Client::new(
        registry,
        Box::new(RoundRobin::new()),
        connector(),
        Arc::new(NoopProtocol),
        Arc::new(JsonSerializer),
        ClientConfig::default(),
    );
    client.start().await.unwrap();

    let mut rx = client.stream(
        "calc".to_string(),
        "subscribe".to_string(),
        vec![1],
        Instant::now() + Duration::from_millis(150),
    );

    let mut received = 0;
    while let Some(item) = rx.recv().await {
        assert!(item.is_ok());
        received += 1;
        if received >= 2 {
            break;
        }
    }
    assert!(received >= 2);
}

#[tokio::test]
async fn unknown_service_surfaces_service_unavailable() {
    let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_millis(50));
    let client = Client::new(
        registry,
        Box::new(RoundRobin::new()),
        connector(),
        Arc::new(NoopProtocol),
        Arc::new(JsonSerializer),
        ClientConfig::default(),
    );
    client.start().await.unwrap();

    let result = client.call("ghost", "add", vec![1], Instant::now() + Duration::from_secs(1)).await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::ServiceUnavailable);
}
