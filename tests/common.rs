#![allow(dead_code)]

use std::sync::{Arc, Once};

use hutch::{Broker, BrokerConfig, Channel, Connection, ConnectionParameters};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = hutch::logging::init_logging();
    });
}

/// A fresh broker with one open connection and channel.
pub fn open(config: BrokerConfig) -> (Arc<Broker>, Connection, Channel) {
    init_logging();
    let broker = Broker::shared(config);
    let conn = Connection::open(Arc::clone(&broker), ConnectionParameters::default());
    let ch = conn.channel().expect("open channel");
    (broker, conn, ch)
}

pub fn open_default() -> (Arc<Broker>, Connection, Channel) {
    open(BrokerConfig::default())
}

pub fn body_str(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}
