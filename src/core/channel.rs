//! Channels: the per-session scope that owns delivery tags, unacked
//! deliveries, prefetch and consumer registrations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::broker::Broker;
use crate::core::connection::{ConnectionId, ConnectionState};
use crate::core::consumer::{
    ConsumeOptions, Consumer, ConsumerCallback, ConsumerInfo, ConsumerSink, ConsumerTag, Handoff,
};
use crate::core::error::{BrokerError, Result};
use crate::core::exchange::{ExchangeDeclareOptions, ExchangeKind};
use crate::core::message::{BasicProperties, Delivery, DeliveryTag};
use crate::core::queue::{DeclareOk, QueueDeclareOptions, QueueDeleteOptions};
use crate::core::tracker::{DeliveryTracker, Unacked};

/// A channel on a [`Connection`](crate::core::connection::Connection).
///
/// Cheap to clone; clones share state. Every operation fails with
/// [`BrokerError::ChannelClosed`] or [`BrokerError::ConnectionClosed`]
/// once the channel or its connection is closed.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    number: u16,
    broker: Arc<Broker>,
    connection: Arc<ConnectionState>,
    closed: AtomicBool,
    prefetch: AtomicU16,
    tracker: DeliveryTracker,
    consumers: Mutex<BTreeMap<ConsumerTag, Arc<Consumer>>>,
    dispatching: AtomicBool,
    closed_notify: Notify,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("connection", &self.inner.connection.id)
            .field("closed", &self.is_closed())
            .field("prefetch", &self.prefetch_count())
            .field("unacked", &self.unacked_count())
            .finish()
    }
}

/// Clears the re-entrancy flag when a dispatch pass ends, even by panic.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Channel {
    pub(crate) fn new(number: u16, broker: Arc<Broker>, connection: Arc<ConnectionState>) -> Self {
        let prefetch = broker.config().default_prefetch;
        Self {
            inner: Arc::new(ChannelInner {
                number,
                broker,
                connection,
                closed: AtomicBool::new(false),
                prefetch: AtomicU16::new(prefetch),
                tracker: DeliveryTracker::new(),
                consumers: Mutex::new(BTreeMap::new()),
                dispatching: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
        }
    }

    pub fn number(&self) -> u16 {
        self.inner.number
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection.id
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.connection.is_closed()
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.connection.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ChannelClosed(self.inner.number));
        }
        Ok(())
    }

    fn conn(&self) -> ConnectionId {
        self.inner.connection.id
    }

    // ───────────────────────────────────────────────────────────
    // Management plane
    // ───────────────────────────────────────────────────────────

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.check_open()?;
        self.inner.broker.declare_exchange(name, kind, &options)
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.check_open()?;
        self.inner.broker.delete_exchange(name, if_unused)
    }

    /// Declares a queue; pass `""` for a generated name. The returned
    /// [`DeclareOk`] carries the resolved name.
    pub fn declare_queue(&self, name: &str, options: QueueDeclareOptions) -> Result<DeclareOk> {
        self.check_open()?;
        self.inner.broker.declare_queue(self.conn(), name, &options)
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        self.inner.broker.bind(self.conn(), queue, exchange, routing_key)
    }

    pub fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        self.inner.broker.unbind(self.conn(), queue, exchange, routing_key)
    }

    /// Returns the number of messages removed.
    pub fn purge(&self, queue: &str) -> Result<usize> {
        self.check_open()?;
        self.inner.broker.purge(self.conn(), queue)
    }

    /// Returns the number of messages discarded with the queue.
    pub fn delete_queue(&self, queue: &str, options: QueueDeleteOptions) -> Result<usize> {
        self.check_open()?;
        self.inner.broker.delete_queue(self.conn(), queue, options)
    }

    // ───────────────────────────────────────────────────────────
    // Publish / get
    // ───────────────────────────────────────────────────────────

    /// Publishes one message and returns how many queues it reached.
    /// See [`Broker::publish`].
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<usize> {
        self.check_open()?;
        self.inner
            .broker
            .publish(exchange, routing_key, body.into(), properties, mandatory)
    }

    /// Pops the head of `queue`. Returns `Ok(None)` when it is empty; never
    /// waits. Without `auto_ack` the delivery stays unacked until settled.
    /// Not subject to prefetch.
    pub fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>> {
        self.check_open()?;
        let queue = self.inner.broker.queue_for(self.conn(), queue)?;
        let Some(message) = queue.pop() else {
            return Ok(None);
        };

        let tag = self.inner.tracker.next_tag();
        let delivery = Delivery::new(tag, None, &message);
        if !auto_ack {
            self.inner.tracker.track(tag, queue.name(), message);
        }
        self.inner.broker.record_delivered();
        trace!(target: "hutch::channel", channel = self.inner.number, queue = queue.name(), %tag, auto_ack, "get");
        Ok(Some(delivery))
    }

    // ───────────────────────────────────────────────────────────
    // Consumers
    // ───────────────────────────────────────────────────────────

    /// Registers `callback` as a consumer of `queue`. Deliveries are made
    /// by the dispatch loop ([`Channel::pump`] and friends).
    pub fn consume<F>(&self, queue: &str, options: ConsumeOptions, callback: F) -> Result<ConsumerTag>
    where
        F: FnMut(&Channel, Delivery) + Send + 'static,
    {
        let callback: ConsumerCallback = Box::new(callback);
        self.register(queue, options, ConsumerSink::Callback(Mutex::new(callback)))
    }

    /// Registers a consumer whose deliveries are sent down a channel.
    /// Dropping the receiver cancels the consumer on the next dispatch.
    pub fn consume_with_receiver(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<(ConsumerTag, flume::Receiver<Delivery>)> {
        let (tx, rx) = flume::unbounded();
        let tag = self.register(queue, options, ConsumerSink::Receiver(tx))?;
        Ok((tag, rx))
    }

    fn register(&self, queue: &str, options: ConsumeOptions, sink: ConsumerSink) -> Result<ConsumerTag> {
        self.check_open()?;
        let queue = self.inner.broker.queue_for(self.conn(), queue)?;

        let mut consumers = self.inner.consumers.lock();
        let tag = match options.consumer_tag.as_deref() {
            Some(tag) if !tag.is_empty() => {
                if consumers.contains_key(tag) {
                    return Err(BrokerError::InvalidArgument(format!(
                        "consumer tag '{tag}' already in use on channel {}",
                        self.inner.number
                    )));
                }
                tag.to_string()
            }
            _ => format!("amq.ctag-{}", Uuid::new_v4().simple()),
        };

        queue.add_consumer(options.exclusive)?;
        debug!(
            target: "hutch::channel",
            channel = self.inner.number,
            consumer_tag = %tag,
            queue = queue.name(),
            auto_ack = options.auto_ack,
            exclusive = options.exclusive,
            "consumer registered"
        );
        let consumer = Consumer::new(tag.clone(), queue, options, sink);
        consumers.insert(tag.clone(), Arc::new(consumer));
        Ok(tag)
    }

    /// Deregisters a consumer. Returns `false` if the tag was unknown.
    pub fn cancel(&self, consumer_tag: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.drop_consumer(consumer_tag))
    }

    fn drop_consumer(&self, consumer_tag: &str) -> bool {
        let removed = self.inner.consumers.lock().remove(consumer_tag);
        match removed {
            Some(consumer) => {
                self.retire(&consumer);
                true
            }
            None => false,
        }
    }

    fn retire(&self, consumer: &Consumer) {
        if consumer.deactivate() {
            self.inner.broker.release_consumer(&consumer.queue);
            debug!(target: "hutch::channel", channel = self.inner.number, consumer_tag = %consumer.tag, "consumer cancelled");
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.inner
            .consumers
            .lock()
            .values()
            .map(|consumer| consumer.info())
            .collect()
    }

    // ───────────────────────────────────────────────────────────
    // Acknowledgements & QoS
    // ───────────────────────────────────────────────────────────

    /// Acknowledges `tag`, or with `multiple` every outstanding tag up to
    /// and including it (tag 0 meaning all).
    pub fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<()> {
        self.check_open()?;
        let resolved = self.inner.tracker.resolve(tag, multiple);
        if resolved.is_empty() {
            return self.unknown_tag(tag, multiple);
        }
        self.inner.broker.record_acked(resolved.len());
        trace!(target: "hutch::channel", channel = self.inner.number, %tag, multiple, count = resolved.len(), "ack");
        self.inner.broker.wake();
        Ok(())
    }

    /// Negatively acknowledges like [`Channel::ack`]; settled messages are
    /// requeued (flagged redelivered) or discarded.
    pub fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        self.check_open()?;
        let resolved = self.inner.tracker.resolve(tag, multiple);
        if resolved.is_empty() {
            return self.unknown_tag(tag, multiple);
        }
        trace!(target: "hutch::channel", channel = self.inner.number, %tag, multiple, requeue, count = resolved.len(), "nack");
        self.settle_negative(resolved, requeue);
        Ok(())
    }

    pub fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.nack(tag, false, requeue)
    }

    fn settle_negative(&self, resolved: Vec<(DeliveryTag, Unacked)>, requeue: bool) {
        if requeue {
            for (_, entry) in resolved {
                self.inner.broker.requeue(&entry.queue, entry.message);
            }
        } else {
            self.inner.broker.record_discarded(resolved.len());
        }
        self.inner.broker.wake();
    }

    fn unknown_tag(&self, tag: DeliveryTag, multiple: bool) -> Result<()> {
        if multiple && tag.value() == 0 {
            return Ok(());
        }
        if self.inner.broker.config().strict_acks {
            return Err(BrokerError::UnknownDeliveryTag(tag.value()));
        }
        debug!(target: "hutch::channel", channel = self.inner.number, %tag, "unknown delivery tag ignored");
        Ok(())
    }

    /// Bounds the number of unacked deliveries the dispatch loop may hand
    /// out on this channel (0 = unlimited).
    pub fn set_qos(&self, prefetch_count: u16) -> Result<()> {
        self.check_open()?;
        self.inner.prefetch.store(prefetch_count, Ordering::Release);
        debug!(target: "hutch::channel", channel = self.inner.number, prefetch_count, "qos set");
        self.inner.broker.wake();
        Ok(())
    }

    pub fn prefetch_count(&self) -> u16 {
        self.inner.prefetch.load(Ordering::Acquire)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_unacked(&self, tag: DeliveryTag) -> bool {
        self.inner.tracker.contains(tag)
    }

    /// Outstanding delivery tags, ascending.
    pub fn unacked_tags(&self) -> Vec<DeliveryTag> {
        self.inner.tracker.tags()
    }

    fn prefetch_reached(&self) -> bool {
        let limit = self.prefetch_count();
        limit != 0 && self.inner.tracker.len() >= usize::from(limit)
    }

    // ───────────────────────────────────────────────────────────
    // Dispatch
    // ───────────────────────────────────────────────────────────

    /// Dispatches the messages that were ready when the call started and
    /// returns the number of deliveries made.
    ///
    /// Consumers are served round-robin, one message each per pass. Each
    /// queue gives out at most as many messages as it held on entry, so
    /// messages requeued or published by callbacks wait for the next call.
    /// The prefetch limit is checked before every delivery. Calling `pump`
    /// from inside a consumer callback returns `Ok(0)`.
    pub fn pump(&self) -> Result<usize> {
        self.check_open()?;
        if self.inner.dispatching.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let _guard = DispatchGuard(&self.inner.dispatching);

        let mut budgets: HashMap<String, usize> = HashMap::new();
        for consumer in self.inner.consumers.lock().values() {
            budgets
                .entry(consumer.queue.name().to_string())
                .or_insert_with(|| consumer.queue.len());
        }

        let mut delivered = 0;
        loop {
            let consumers: Vec<Arc<Consumer>> =
                self.inner.consumers.lock().values().cloned().collect();
            let mut progressed = false;

            for consumer in consumers {
                if self.is_closed() {
                    return Ok(delivered);
                }
                if !consumer.is_active() || self.prefetch_reached() {
                    continue;
                }
                if consumer.queue.is_deleted() {
                    debug!(target: "hutch::channel", consumer_tag = %consumer.tag, queue = consumer.queue.name(), "queue deleted under consumer");
                    self.drop_consumer(&consumer.tag);
                    continue;
                }
                let budget = budgets
                    .entry(consumer.queue.name().to_string())
                    .or_insert_with(|| consumer.queue.len());
                if *budget == 0 {
                    continue;
                }
                if self.deliver_one(&consumer) {
                    *budget -= 1;
                    delivered += 1;
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
        Ok(delivered)
    }

    fn deliver_one(&self, consumer: &Consumer) -> bool {
        let Some(message) = consumer.queue.pop() else {
            return false;
        };

        let tag = self.inner.tracker.next_tag();
        let delivery = Delivery::new(tag, Some(consumer.tag.clone()), &message);
        if !consumer.auto_ack {
            self.inner
                .tracker
                .track(tag, consumer.queue.name(), message.clone());
        }

        match consumer.deliver(self, delivery) {
            Handoff::Delivered => {
                self.inner.broker.record_delivered();
                trace!(target: "hutch::channel", channel = self.inner.number, consumer_tag = %consumer.tag, %tag, "delivered");
                true
            }
            Handoff::SinkClosed => {
                if !consumer.auto_ack {
                    self.inner.tracker.resolve(tag, false);
                }
                if !consumer.queue.push_front(message) {
                    self.inner.broker.record_discarded(1);
                }
                debug!(target: "hutch::channel", consumer_tag = %consumer.tag, "receiver dropped; cancelling consumer");
                self.drop_consumer(&consumer.tag);
                false
            }
        }
    }

    /// Keeps dispatching as messages arrive until the channel closes or
    /// has no consumers left.
    ///
    /// Wakes on publish, requeue, ack and QoS changes, so prefetch-blocked
    /// consumers resume as soon as capacity frees up.
    pub async fn start_consuming(&self) -> Result<()> {
        loop {
            let wakeup = self.inner.broker.notified();
            let closed = self.inner.closed_notify.notified();
            tokio::pin!(wakeup, closed);
            wakeup.as_mut().enable();
            closed.as_mut().enable();

            if self.is_closed() {
                return Ok(());
            }
            let delivered = self.pump()?;
            if self.consumer_count() == 0 {
                return Ok(());
            }
            if delivered > 0 {
                tokio::task::yield_now().await;
            }

            tokio::select! {
                _ = &mut wakeup => {}
                _ = &mut closed => return Ok(()),
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Close
    // ───────────────────────────────────────────────────────────

    /// Closes the channel: cancels its consumers and requeues (or drops,
    /// per `requeue_on_close`) its unacked deliveries. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let consumers = std::mem::take(&mut *self.inner.consumers.lock());
        for consumer in consumers.values() {
            self.retire(consumer);
        }

        let unacked = self.inner.tracker.drain();
        let outstanding = unacked.len();
        if !unacked.is_empty() {
            let requeue = self.inner.broker.config().requeue_on_close;
            self.settle_negative(unacked, requeue);
        }

        self.inner.closed_notify.notify_waiters();
        debug!(
            target: "hutch::channel",
            channel = self.inner.number,
            connection = %self.inner.connection.identity,
            consumers = consumers.len(),
            unacked = outstanding,
            "channel closed"
        );
    }
}
