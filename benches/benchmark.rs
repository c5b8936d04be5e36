//! Broadcast fan-out benchmarks.
//!
//! Measures how long one state broadcast takes as the number of registered
//! connections grows. Connections write into in-memory sinks, so the numbers
//! cover serialization, the registry snapshot and the concurrent send path
//! without any socket I/O.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::sink;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use state_relay::server::{Client, ClientRegistry, HealthMetrics, ServerMessage};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tungstenite::Message;

/// A registry populated with `count` connections that accept every frame.
fn populated_registry(rt: &Runtime, count: usize) -> ClientRegistry {
    let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let metrics = HealthMetrics::new().expect("metrics registry");
    let clients = ClientRegistry::new(metrics);

    // Writer tasks are spawned on the benchmark runtime.
    let _guard = rt.enter();
    for _ in 0..count {
        let writer = Box::pin(sink::unfold((), |(), _frame: Message| async move {
            Ok::<_, tungstenite::Error>(())
        }));
        clients.add(Client::new(addr, writer, CancellationToken::new()));
    }
    clients
}

/// A state payload shaped like a typical overlay update.
fn sample_state() -> ServerMessage {
    let party: Vec<Value> = (0..6)
        .map(|i| json!({"name": format!("member-{}", i), "hp": 40 + i, "conditions": ["blessed"]}))
        .collect();
    let mut state = Map::new();
    state.insert("party".into(), Value::Array(party));
    state.insert("activeIdx".into(), json!(2));
    ServerMessage::State { state }
}

/// Benchmarks a single broadcast across increasing audience sizes.
fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let payload = sample_state();
    let mut group = c.benchmark_group("broadcast");

    for viewers in [1usize, 10, 100, 1000] {
        let clients = populated_registry(&rt, viewers);
        let (clients, payload) = (&clients, &payload);
        group.bench_with_input(BenchmarkId::from_parameter(viewers), &viewers, |b, _| {
            b.to_async(&rt).iter(|| async move {
                let attempted = clients.broadcast(payload, None).await.unwrap();
                assert_eq!(attempted, viewers);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_broadcast);
criterion_main!(benches);
