//! Performance benchmarks for glob matching and message delivery.

use courier::glob::glob_match;
use courier::{
    CommandGateway, Delivery, MemoryBroker, PubSubClient, PubSubConfig, SubscriptionMode, Topology,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn client(broker: &Arc<MemoryBroker>) -> PubSubClient {
    let gateway: Arc<dyn CommandGateway> = Arc::new(broker.connect());
    PubSubClient::new(
        gateway,
        Topology::Standalone,
        PubSubConfig::default(),
        Delivery::Queue,
    )
    .unwrap()
}

/// Benchmark glob matching across pattern shapes
fn bench_glob(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob");
    let channel = "events.orders.eu-west.created";

    for (name, pattern) in [
        ("literal", "events.orders.eu-west.created"),
        ("prefix", "events.*"),
        ("infix", "events.*.eu-*.created"),
        ("class", "events.[a-z]rders.eu-????.*"),
        ("miss", "*.payments.*"),
    ] {
        group.bench_with_input(BenchmarkId::new("pattern", name), &pattern, |b, pattern| {
            b.iter(|| black_box(glob_match(pattern, black_box(channel))));
        });
    }

    group.finish();
}

/// Benchmark end-to-end delivery with a growing number of pattern subscriptions
fn bench_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("delivery");

    for patterns in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("patterns", patterns),
            &patterns,
            |b, &count| {
                let broker = MemoryBroker::new();
                let client = client(&broker);
                let mut topics: Vec<String> = (0..count - 1).map(|i| format!("other.{i}.*")).collect();
                topics.push("bench.*".to_string());
                client.psubscribe_blocking(topics, 5000).unwrap();
                let queue = client.get_queue().unwrap();

                b.iter(|| {
                    client.publish("bench.tick", b"payload").unwrap();
                    black_box(queue.wait_for_message_timeout(Duration::from_secs(1)).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark blocking subscribe/unsubscribe round trips
fn bench_round_trip(c: &mut Criterion) {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    c.bench_function("subscribe_unsubscribe_blocking", |b| {
        b.iter(|| {
            client
                .subscribe_blocking(SubscriptionMode::Exact, ["bench"], 1000)
                .unwrap();
            client
                .unsubscribe_blocking(SubscriptionMode::Exact, ["bench"], 1000)
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_glob, bench_delivery, bench_round_trip);
criterion_main!(benches);
