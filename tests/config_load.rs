#[path = "common.rs"]
mod common;

use hutch::{Broker, Config, ExchangeKind};

#[test]
fn load_config_matches_toml() {
    let cfg: Config = Config::load_with_env(Some("hutch.toml"), |_| None).expect("failed to load config");

    assert_eq!(cfg.broker.default_prefetch, 0);
    assert!(!cfg.broker.strict_acks);
    assert!(!cfg.broker.auto_create_queues);
    assert!(cfg.broker.requeue_on_close);

    let names: Vec<_> = cfg.topology.exchanges.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["events", "broadcast"]);
    assert_eq!(cfg.topology.exchanges[0].kind, ExchangeKind::Topic);
    assert_eq!(cfg.topology.queues.len(), 2);
    assert_eq!(cfg.topology.bindings.len(), 3);
    assert_eq!(cfg.topology.bindings[2].routing_key, "");
}

#[test]
fn hutch_config_variable_supplies_the_path() {
    let cfg = Config::load_with_env(None, |key| match key {
        "HUTCH_CONFIG" => Some("hutch.toml".to_string()),
        "HUTCH_STRICT_ACKS" => Some("true".to_string()),
        _ => None,
    })
    .expect("failed to load config");

    assert!(cfg.broker.strict_acks);
    assert_eq!(cfg.topology.queues[0].name, "audit");
}

#[test]
fn configured_topology_routes_messages() {
    common::init_logging();
    let cfg = Config::load_with_env(Some("hutch.toml"), |_| None).unwrap();
    let broker = Broker::from_config(&cfg).unwrap();

    assert!(broker.queue_exists("audit"));
    assert_eq!(broker.route("events", "db.error").unwrap(), ["audit", "errors"]);
    assert_eq!(broker.route("events", "db.info").unwrap(), ["audit"]);
    assert_eq!(broker.route("broadcast", "anything").unwrap(), ["audit"]);
}

#[test]
fn topology_with_unknown_queue_fails_to_build() {
    let cfg = Config::from_toml_str(
        r#"
        [[topology.bindings]]
        queue = "missing"
        exchange = "amq.direct"
        routing_key = "k"
        "#,
    )
    .unwrap();
    let err = Broker::from_config(&cfg).unwrap_err();
    assert_eq!(err.reply_code(), 404);
}
