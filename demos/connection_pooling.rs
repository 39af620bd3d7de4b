//! Connection Pooling Example
//!
//! Demonstrates a `Client` driving concurrent calls against a single
//! registered service, backed by a bounded per-endpoint connection pool,
//! and reading back pool/call metrics afterward.
//!
//! Run with: cargo run --example connection_pooling

use std::sync::Arc;
use std::time::{Duration, Instant};

use rpc_mesh_core::balancer::RoundRobin;
use rpc_mesh_core::connection::RawChannel;
use rpc_mesh_core::protocol::NoopProtocol;
use rpc_mesh_core::registry::memory::MemoryRegistry;
use rpc_mesh_core::serializer::JsonSerializer;
use rpc_mesh_core::{Client, ClientConfig, MetricsCollector, PoolConfig, Registry, ServiceInfo};

struct FakeChannel;
impl RawChannel for FakeChannel {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Connection Pooling Example ===\n");

    println!("1. Registering the 'calc' service...");
    let registry = MemoryRegistry::new("default", Duration::from_secs(30), Duration::from_secs(5));
    registry
        .register(ServiceInfo::new("svc-1", "calc", "127.0.0.1", 9001))
        .await?;
    println!("   registered svc-1 at 127.0.0.1:9001\n");

    println!("2. Configuring the connection pool...");
    let config = ClientConfig {
        pool: PoolConfig {
            min_connections: 5,
            max_connections: 20,
            connection_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            max_lifetime_ms: 1_800_000,
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    };
    println!("   min={} max={}\n", config.pool.min_connections, config.pool.max_connections);

    let client = Client::new(
        registry,
        Box::new(RoundRobin::new()),
        Arc::new(|_endpoint, _timeout| Box::pin(async move { Ok(Box::new(FakeChannel) as Box<dyn RawChannel>) })),
        Arc::new(NoopProtocol),
        Arc::new(JsonSerializer),
        config,
    );
    client.start().await?;
    println!("3. Client started\n");

    println!("4. Running 20 concurrent calls...");
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..20 {
        let handle = client.call_async(
            "calc".to_string(),
            "add".to_string(),
            vec![i as u8],
            tokio::time::Instant::now() + Duration::from_secs(5),
        );
        handles.push(handle);
    }

    let mut success_count = 0;
    let mut error_count = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => success_count += 1,
            Err(_) => error_count += 1,
        }
    }
    println!(
        "   completed in {:?} — {} succeeded, {} failed\n",
        start.elapsed(),
        success_count,
        error_count
    );

    println!("5. Recording call latencies into a metrics collector...");
    let metrics = MetricsCollector::new();
    for i in 0..5u32 {
        let call_start = Instant::now();
        client
            .call("calc", "add", vec![i as u8], tokio::time::Instant::now() + Duration::from_secs(5))
            .await?;
        metrics.record_call("calc", true, call_start.elapsed().as_secs_f64() * 1000.0).await;
    }

    let snapshot = metrics.get_metrics().await;
    let calc_metrics = &snapshot.call_metrics["calc"];
    println!("   total={} p50={:.2}ms p95={:.2}ms\n", calc_metrics.total_count, calc_metrics.percentiles.p50, calc_metrics.percentiles.p95);

    println!("6. Shutting down...");
    client.shutdown(Duration::from_secs(5)).await?;
    println!("   ✓ shut down\n");

    println!("=== Example completed successfully! ===");
    Ok(())
}
