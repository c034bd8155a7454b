use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use hutch::{
    topic_matches, BasicProperties, Broker, BrokerConfig, Connection, ConnectionParameters,
    ExchangeDeclareOptions, ExchangeKind, QueueDeclareOptions,
};

const PATTERNS: &[(&str, &str)] = &[
    ("stock.*.nyse", "stock.usd.nyse"),
    ("stock.#", "stock.usd.guest.nyse"),
    ("#.error", "app.db.replica.error"),
    ("a.#.z", "a.b.c.d.e.f.g.h.z"),
    ("*.*.*", "one.two"),
];

fn bench_topic_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matches");
    for (pattern, key) in PATTERNS {
        group.bench_with_input(BenchmarkId::new(*pattern, *key), &(pattern, key), |b, (p, k)| {
            b.iter(|| black_box(topic_matches(black_box(p), black_box(k))));
        });
    }
    group.finish();
}

fn bench_publish_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_get");

    for &bindings in [1usize, 16, 256].iter() {
        let broker = Broker::shared(BrokerConfig::default());
        let conn = Connection::open(Arc::clone(&broker), ConnectionParameters::default());
        let ch = conn.channel().unwrap();
        ch.declare_exchange("bench", ExchangeKind::Topic, ExchangeDeclareOptions::default())
            .unwrap();
        ch.declare_queue("sink", QueueDeclareOptions::default()).unwrap();
        for i in 0..bindings {
            ch.bind("sink", "bench", &format!("region{i}.*.orders")).unwrap();
        }
        ch.bind("sink", "bench", "#.orders").unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("topic", bindings), |b| {
            b.iter(|| {
                ch.publish("bench", "region0.eu.orders", "payload", BasicProperties::default(), true)
                    .unwrap();
                let delivery = ch.get("sink", false).unwrap().unwrap();
                ch.ack(delivery.delivery_tag, false).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_topic_matcher, bench_publish_get);
criterion_main!(benches);
