//! The broker: exchange, queue and binding tables shared by every
//! connection, plus the routing algorithm that ties them together.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{Config, Topology};
use crate::core::connection::ConnectionId;
use crate::core::error::{BrokerError, Result};
use crate::core::exchange::{
    Exchange, ExchangeDeclareOptions, ExchangeKind, BUILTIN_EXCHANGES, DEFAULT_EXCHANGE,
};
use crate::core::message::{BasicProperties, Message};
use crate::core::queue::{DeclareOk, Queue, QueueDeclareOptions, QueueDeleteOptions};
use crate::core::routing::BindingTable;

/// Longest name or routing key AMQP's short strings can carry.
pub const MAX_NAME_LEN: usize = 255;

/// Behavioural switches for a broker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Prefetch every new channel starts with (0 = unlimited).
    pub default_prefetch: u16,
    /// Fail ack/nack/reject on unknown tags instead of ignoring them.
    pub strict_acks: bool,
    /// Declare the target queue on a default-exchange publish that has no route.
    pub auto_create_queues: bool,
    /// Requeue a closing channel's unacked deliveries rather than drop them.
    pub requeue_on_close: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_prefetch: 0,
            strict_acks: false,
            auto_create_queues: false,
            requeue_on_close: true,
        }
    }
}

/// Snapshot of the broker's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    /// Message copies enqueued (one publish can route to many queues).
    pub routed: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    routed: AtomicU64,
    unroutable: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
}

/// Shared routing and storage state.
///
/// One instance is created per test or simulation and handed to every
/// [`Connection`](crate::core::connection::Connection) as an `Arc`. Lock
/// order is exchanges, then bindings, then individual queues; the queue
/// table is a `DashMap` so unrelated queues never contend.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
    queues: DashMap<String, Arc<Queue>>,
    bindings: RwLock<BindingTable>,
    next_connection_id: AtomicU64,
    wakeup: Notify,
    counters: Counters,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

fn check_name(value: &str, what: &str) -> Result<()> {
    if value.len() > MAX_NAME_LEN {
        return Err(BrokerError::InvalidArgument(format!(
            "{what} is {} bytes long, the limit is {MAX_NAME_LEN}",
            value.len()
        )));
    }
    Ok(())
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            Arc::new(Exchange::builtin(DEFAULT_EXCHANGE, ExchangeKind::Direct)),
        );
        for (name, kind) in BUILTIN_EXCHANGES {
            exchanges.insert(name.to_string(), Arc::new(Exchange::builtin(name, *kind)));
        }

        Self {
            config,
            exchanges: RwLock::new(exchanges),
            queues: DashMap::new(),
            bindings: RwLock::new(BindingTable::new()),
            next_connection_id: AtomicU64::new(1),
            wakeup: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Convenience constructor returning the shared handle connections take.
    pub fn shared(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Builds a broker from a loaded [`Config`] and declares its topology.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let broker = Self::shared(config.broker.clone());
        broker.apply_topology(&config.topology)?;
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Declares every exchange, queue and binding in `topology`, in that
    /// order. Entities are owned by no connection.
    pub fn apply_topology(&self, topology: &Topology) -> Result<()> {
        for entry in &topology.exchanges {
            let options = ExchangeDeclareOptions {
                durable: entry.durable,
                auto_delete: entry.auto_delete,
                internal: entry.internal,
                ..Default::default()
            };
            self.declare_exchange(&entry.name, entry.kind, &options)?;
        }
        for entry in &topology.queues {
            let options = QueueDeclareOptions {
                durable: entry.durable,
                auto_delete: entry.auto_delete,
                ..Default::default()
            };
            self.declare_queue(ConnectionId::SYSTEM, &entry.name, &options)?;
        }
        for entry in &topology.bindings {
            self.bind(ConnectionId::SYSTEM, &entry.queue, &entry.exchange, &entry.routing_key)?;
        }
        info!(
            target: "hutch::broker",
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "topology applied"
        );
        Ok(())
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::from_raw(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    // ───────────────────────────────────────────────────────────
    // Exchanges
    // ───────────────────────────────────────────────────────────

    /// Declares `name`. Passive declares only check existence; otherwise
    /// the entry is inserted, replacing any previous one.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeDeclareOptions,
    ) -> Result<()> {
        check_name(name, "exchange name")?;

        if options.passive {
            if self.exchanges.read().contains_key(name) {
                return Ok(());
            }
            return Err(BrokerError::exchange_not_found(name));
        }

        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "operation not permitted on the default exchange".to_string(),
            ));
        }

        let exchange = Arc::new(Exchange::new(name, kind, options));
        self.exchanges.write().insert(name.to_string(), exchange);
        debug!(target: "hutch::broker", exchange = name, %kind, durable = options.durable, "exchange declared");
        Ok(())
    }

    /// Deletes `name` and every binding sourced from it.
    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "operation not permitted on the default exchange".to_string(),
            ));
        }

        let mut exchanges = self.exchanges.write();
        if !exchanges.contains_key(name) {
            return Err(BrokerError::exchange_not_found(name));
        }
        let mut bindings = self.bindings.write();
        if if_unused && bindings.has_bindings(name) {
            return Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' in use"
            )));
        }
        let dropped = bindings.remove_exchange(name);
        exchanges.remove(name);
        debug!(target: "hutch::broker", exchange = name, bindings = dropped, "exchange deleted");
        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.exchanges.read().get(name).map(|e| Exchange::clone(e))
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.exchanges.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ───────────────────────────────────────────────────────────
    // Queues
    // ───────────────────────────────────────────────────────────

    /// Declares a queue on behalf of connection `conn`. An empty name gets
    /// a generated `amq.gen-` name. Re-declaring an existing queue leaves
    /// it untouched.
    pub fn declare_queue(
        &self,
        conn: ConnectionId,
        name: &str,
        options: &QueueDeclareOptions,
    ) -> Result<DeclareOk> {
        check_name(name, "queue name")?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let queue = if options.passive {
            self.queue_for(conn, &name)?
        } else {
            match self.queues.entry(name.clone()) {
                Entry::Occupied(entry) => {
                    let queue = Arc::clone(entry.get());
                    queue.check_access(conn)?;
                    queue
                }
                Entry::Vacant(entry) => {
                    let queue = Arc::new(Queue::new(name.as_str(), options, conn));
                    entry.insert(Arc::clone(&queue));
                    debug!(
                        target: "hutch::broker",
                        queue = %name,
                        durable = options.durable,
                        exclusive = options.exclusive,
                        auto_delete = options.auto_delete,
                        "queue declared"
                    );
                    queue
                }
            }
        };

        Ok(DeclareOk {
            queue: name,
            message_count: u32::try_from(queue.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(queue.consumer_count()).unwrap_or(u32::MAX),
        })
    }

    /// Looks up `name` for use by `conn`, enforcing exclusive ownership.
    pub(crate) fn queue_for(&self, conn: ConnectionId, name: &str) -> Result<Arc<Queue>> {
        let queue = self
            .queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::queue_not_found(name))?;
        queue.check_access(conn)?;
        Ok(queue)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Number of messages waiting on `name`, if it exists.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|q| q.len())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Empties a queue, returning how many messages were dropped.
    pub fn purge(&self, conn: ConnectionId, name: &str) -> Result<usize> {
        let queue = self.queue_for(conn, name)?;
        let count = queue.purge();
        self.counters
            .discarded
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(target: "hutch::broker", queue = name, count, "queue purged");
        Ok(count)
    }

    /// Deletes a queue with its messages and bindings. Returns how many
    /// messages were discarded.
    pub fn delete_queue(
        &self,
        conn: ConnectionId,
        name: &str,
        options: QueueDeleteOptions,
    ) -> Result<usize> {
        let queue = self.queue_for(conn, name)?;
        self.remove_queue(&queue, options)
    }

    fn remove_queue(&self, queue: &Arc<Queue>, options: QueueDeleteOptions) -> Result<usize> {
        let discarded = queue.mark_deleted(options)?;
        let name = queue.name();
        self.queues.remove_if(name, |_, current| Arc::ptr_eq(current, queue));

        let mut exchanges = self.exchanges.write();
        let emptied = self.bindings.write().remove_queue(name);
        for exchange in emptied {
            if exchanges.get(&exchange).is_some_and(|e| e.auto_delete) {
                exchanges.remove(&exchange);
                debug!(target: "hutch::broker", exchange = %exchange, "auto-delete exchange removed");
            }
        }
        drop(exchanges);

        self.counters
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        debug!(target: "hutch::broker", queue = name, discarded, "queue deleted");
        Ok(discarded)
    }

    /// Called when a consumer on `queue` goes away; deletes auto-delete
    /// queues that just lost their last consumer.
    pub(crate) fn release_consumer(&self, queue: &Arc<Queue>) {
        let remaining = queue.remove_consumer();
        if remaining == 0 && queue.is_auto_delete() && !queue.is_deleted() {
            if let Err(err) = self.remove_queue(queue, QueueDeleteOptions::default()) {
                warn!(target: "hutch::broker", queue = queue.name(), %err, "auto-delete failed");
            }
        }
    }

    /// Deletes every exclusive queue owned by `conn`.
    pub(crate) fn drop_exclusive_queues(&self, conn: ConnectionId) -> usize {
        let owned: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .filter(|entry| entry.value().owner() == Some(conn))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut dropped = 0;
        for queue in owned {
            if self.remove_queue(&queue, QueueDeleteOptions::default()).is_ok() {
                dropped += 1;
            }
        }
        dropped
    }

    // ───────────────────────────────────────────────────────────
    // Bindings
    // ───────────────────────────────────────────────────────────

    /// Binds `queue` to `exchange` under `routing_key`; a repeated bind is
    /// a no-op.
    pub fn bind(&self, conn: ConnectionId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        check_name(routing_key, "routing key")?;

        let exchanges = self.exchanges.read();
        let source = exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        if source.is_default() {
            return Err(BrokerError::AccessRefused(
                "operation not permitted on the default exchange".to_string(),
            ));
        }
        self.queue_for(conn, queue)?;

        let added = self.bindings.write().bind(exchange, routing_key, queue);
        if added {
            debug!(target: "hutch::broker", queue, exchange, routing_key, "queue bound");
        }
        Ok(())
    }

    /// Removes a binding; a no-op if it does not exist.
    pub fn unbind(&self, conn: ConnectionId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if let Some(target) = self.queues.get(queue).map(|e| Arc::clone(e.value())) {
            target.check_access(conn)?;
        }

        let mut exchanges = self.exchanges.write();
        let mut bindings = self.bindings.write();
        if !bindings.unbind(exchange, routing_key, queue) {
            return Ok(());
        }
        debug!(target: "hutch::broker", queue, exchange, routing_key, "queue unbound");

        let auto_delete = exchanges.get(exchange).is_some_and(|e| e.auto_delete);
        if auto_delete && !bindings.has_bindings(exchange) {
            exchanges.remove(exchange);
            debug!(target: "hutch::broker", exchange, "auto-delete exchange removed");
        }
        Ok(())
    }

    /// Every binding as `(exchange, routing key, queue)`.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.bindings.read().entries()
    }

    // ───────────────────────────────────────────────────────────
    // Routing & publishing
    // ───────────────────────────────────────────────────────────

    /// Resolves the queues a message published to `exchange` with
    /// `routing_key` would reach, sorted and de-duplicated.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        let source = self
            .exchanges
            .read()
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        Ok(self.route_via(&source, routing_key).into_iter().collect())
    }

    fn route_via(&self, exchange: &Exchange, routing_key: &str) -> BTreeSet<String> {
        if exchange.is_default() {
            let mut targets = BTreeSet::new();
            if self.queues.contains_key(routing_key) {
                targets.insert(routing_key.to_string());
            }
            return targets;
        }
        self.bindings
            .read()
            .route(&exchange.name, exchange.kind, routing_key)
    }

    /// Routes and enqueues one message, returning how many queues took a
    /// copy.
    ///
    /// With `mandatory`, a message that matches no queue fails with
    /// [`BrokerError::Unroutable`] and is stored nowhere; otherwise it is
    /// dropped silently.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<usize> {
        check_name(routing_key, "routing key")?;

        let source = self
            .exchanges
            .read()
            .get(exchange)
            .cloned()
            .ok_or_else(|| BrokerError::exchange_not_found(exchange))?;
        if source.internal {
            return Err(BrokerError::AccessRefused(format!(
                "cannot publish to internal exchange '{exchange}'"
            )));
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut targets = self.route_via(&source, routing_key);
        if targets.is_empty()
            && source.is_default()
            && self.config.auto_create_queues
            && !routing_key.is_empty()
        {
            let ok = self.declare_queue(
                ConnectionId::SYSTEM,
                routing_key,
                &QueueDeclareOptions::default(),
            )?;
            debug!(target: "hutch::broker", queue = %ok.queue, "queue created on first publish");
            targets.insert(ok.queue);
        }

        if targets.is_empty() {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(target: "hutch::broker", exchange, routing_key, mandatory, "message unroutable");
            if mandatory {
                return Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            return Ok(0);
        }

        let message = Message::new(exchange, routing_key, body, properties);
        let mut routed = 0;
        for name in &targets {
            let Some(queue) = self.queues.get(name).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if queue.push(message.clone()) {
                routed += 1;
            }
        }

        self.counters
            .routed
            .fetch_add(routed as u64, Ordering::Relaxed);
        trace!(target: "hutch::broker", exchange, routing_key, routed, "message published");
        if routed > 0 {
            self.wake();
        }
        Ok(routed)
    }

    /// Puts a nacked/rejected message back on the tail of `queue`, flagged
    /// redelivered. Discards it if the queue no longer exists.
    pub(crate) fn requeue(&self, queue: &str, message: Message) -> bool {
        let target = self.queues.get(queue).map(|e| Arc::clone(e.value()));
        match target {
            Some(target) if target.push(message.into_redelivered()) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(target: "hutch::broker", queue, "requeue target is gone; message discarded");
                false
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Dispatch wake-ups & stats
    // ───────────────────────────────────────────────────────────

    /// Wakes every task parked in `start_consuming`.
    pub(crate) fn wake(&self) {
        self.wakeup.notify_waiters();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    pub(crate) fn record_delivered(&self) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self, count: usize) {
        self.counters
            .acked
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: usize) {
        self.counters
            .discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            routed: c.routed.load(Ordering::Relaxed),
            unroutable: c.unroutable.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}
