//! Hutch – an in-process AMQP 0-9-1 style message broker.
//!
//! This crate exports
//!  * `core`    – exchanges, queues, bindings, routing, channels and the
//!                acknowledgement state machine
//!  * `config`  – TOML-driven broker configuration
//!  * `logging` – `tracing` subscriber setup
//!
//! Everything runs inside the calling process: a [`Broker`] is shared by
//! any number of [`Connection`]s, each of which opens [`Channel`]s that
//! publish, fetch, consume and acknowledge messages.
//!
//! ```no_run
//! use hutch::{BasicProperties, Broker, BrokerConfig, Connection, ConnectionParameters};
//!
//! # fn main() -> hutch::Result<()> {
//! let broker = Broker::shared(BrokerConfig::default());
//! let conn = Connection::open(broker, ConnectionParameters::default());
//! let ch = conn.channel()?;
//! let q = ch.declare_queue("jobs", Default::default())?;
//! ch.publish("", &q.queue, "hello", BasicProperties::default(), false)?;
//! if let Some(delivery) = ch.get("jobs", false)? {
//!     ch.ack(delivery.delivery_tag, false)?;
//! }
//! # Ok(())
//! # }
//! ```

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::config::{Config, ConfigError};
pub use crate::core::broker::{Broker, BrokerConfig, BrokerStats};
pub use crate::core::channel::Channel;
pub use crate::core::connection::{Connection, ConnectionId, ConnectionParameters, PlainCredentials};
pub use crate::core::consumer::{ConsumeOptions, ConsumerInfo, ConsumerTag};
pub use crate::core::error::{BrokerError, EntityKind, Result};
pub use crate::core::exchange::{ExchangeDeclareOptions, ExchangeKind, DEFAULT_EXCHANGE};
pub use crate::core::message::{BasicProperties, Delivery, DeliveryTag, FieldTable, FieldValue};
pub use crate::core::queue::{DeclareOk, QueueDeclareOptions, QueueDeleteOptions};
pub use crate::core::routing::{topic_matches, BindingTable};
