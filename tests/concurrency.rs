#[path = "common.rs"]
mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use hutch::{
    BasicProperties, Broker, BrokerConfig, Connection, ConnectionParameters, ConsumeOptions,
    ExchangeDeclareOptions, ExchangeKind, QueueDeclareOptions,
};

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 500;

#[test]
fn concurrent_publish_and_get_loses_nothing() {
    common::init_logging();
    let broker = Broker::shared(BrokerConfig::default());
    {
        let conn = Connection::open(Arc::clone(&broker), ConnectionParameters::default());
        let ch = conn.channel().unwrap();
        ch.declare_queue("work", QueueDeclareOptions::default()).unwrap();
    }

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                let conn = Connection::open(broker, ConnectionParameters::default());
                let ch = conn.channel().unwrap();
                for i in 0..PER_PRODUCER {
                    ch.publish("", "work", format!("{p}-{i}"), BasicProperties::default(), true)
                        .unwrap();
                }
            })
        })
        .collect();

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let taken = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let broker = Arc::clone(&broker);
            let seen = Arc::clone(&seen);
            let taken = Arc::clone(&taken);
            thread::spawn(move || {
                let conn = Connection::open(broker, ConnectionParameters::default());
                let ch = conn.channel().unwrap();
                while taken.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                    match ch.get("work", false).unwrap() {
                        Some(delivery) => {
                            let body = common::body_str(&delivery.body);
                            assert!(seen.lock().insert(body), "duplicate delivery");
                            ch.ack(delivery.delivery_tag, false).unwrap();
                            taken.fetch_add(1, Ordering::SeqCst);
                        }
                        None => thread::yield_now(),
                    }
                }
                assert_eq!(ch.unacked_count(), 0);
            })
        })
        .collect();

    for handle in producers.into_iter().chain(consumers) {
        handle.join().unwrap();
    }

    assert_eq!(seen.lock().len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(broker.queue_depth("work"), Some(0));
    let stats = broker.stats();
    assert_eq!(stats.published, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.acked, (PRODUCERS * PER_PRODUCER) as u64);
}

#[test]
fn per_queue_fifo_holds_for_each_producer() {
    common::init_logging();
    let broker = Broker::shared(BrokerConfig::default());
    let conn = Connection::open(Arc::clone(&broker), ConnectionParameters::default());
    let ch = conn.channel().unwrap();
    ch.declare_exchange("fan", ExchangeKind::Fanout, ExchangeDeclareOptions::default())
        .unwrap();
    for q in ["left", "right"] {
        ch.declare_queue(q, QueueDeclareOptions::default()).unwrap();
        ch.bind(q, "fan", "").unwrap();
    }

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let ch = conn.channel().unwrap();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    ch.publish("fan", "", format!("{p}:{i}"), BasicProperties::default(), false)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().unwrap();
    }

    for q in ["left", "right"] {
        let mut last = vec![None::<usize>; PRODUCERS];
        let mut count = 0;
        while let Some(delivery) = ch.get(q, true).unwrap() {
            let body = common::body_str(&delivery.body);
            let (p, i) = body.split_once(':').unwrap();
            let (p, i): (usize, usize) = (p.parse().unwrap(), i.parse().unwrap());
            assert!(last[p].map_or(true, |prev| prev < i));
            last[p] = Some(i);
            count += 1;
        }
        assert_eq!(count, PRODUCERS * PER_PRODUCER);
    }
}

#[test]
fn dispatch_on_many_channels_in_parallel() {
    common::init_logging();
    let broker = Broker::shared(BrokerConfig {
        default_prefetch: 8,
        ..Default::default()
    });
    let conn = Connection::open(Arc::clone(&broker), ConnectionParameters::default());
    let setup = conn.channel().unwrap();
    setup.declare_queue("tasks", QueueDeclareOptions::default()).unwrap();
    for i in 0..1_000 {
        setup
            .publish("", "tasks", i.to_string(), BasicProperties::default(), true)
            .unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let ch = conn.channel().unwrap();
            assert_eq!(ch.prefetch_count(), 8);
            let counter = Arc::clone(&handled);
            ch.consume("tasks", ConsumeOptions::default(), move |channel, delivery| {
                counter.fetch_add(1, Ordering::SeqCst);
                channel.ack(delivery.delivery_tag, false).unwrap();
            })
            .unwrap();
            thread::spawn(move || {
                while ch.pump().unwrap() > 0 {}
            })
        })
        .collect();
    for handle in workers {
        handle.join().unwrap();
    }

    assert_eq!(handled.load(Ordering::SeqCst), 1_000);
    assert_eq!(broker.queue_depth("tasks"), Some(0));
}
