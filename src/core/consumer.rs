//! Consumer registrations and the sinks deliveries are pushed into.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::channel::Channel;
use crate::core::message::{Delivery, FieldTable};
use crate::core::queue::Queue;

/// Consumer tag, unique within one channel.
pub type ConsumerTag = String;

/// Callback invoked synchronously by the dispatch loop for each delivery.
///
/// The channel is passed in so the callback can ack, nack or cancel from
/// inside the handler.
pub type ConsumerCallback = Box<dyn FnMut(&Channel, Delivery) + Send + 'static>;

/// Options for `consume`.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Caller-chosen tag; generated when `None`.
    pub consumer_tag: Option<String>,
    /// Deliveries are settled on send and never tracked.
    pub auto_ack: bool,
    /// Refuse to share the queue with other consumers.
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl ConsumeOptions {
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

pub(crate) enum ConsumerSink {
    Callback(Mutex<ConsumerCallback>),
    Receiver(flume::Sender<Delivery>),
}

impl fmt::Debug for ConsumerSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerSink::Callback(_) => f.write_str("Callback"),
            ConsumerSink::Receiver(tx) => f
                .debug_struct("Receiver")
                .field("pending", &tx.len())
                .finish(),
        }
    }
}

/// Outcome of handing one delivery to a consumer.
pub(crate) enum Handoff {
    Delivered,
    /// The receiving end is gone; the delivery never reached anyone.
    SinkClosed,
}

/// Read-only view of a registered consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub tag: ConsumerTag,
    pub queue: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

#[derive(Debug)]
pub(crate) struct Consumer {
    pub tag: ConsumerTag,
    pub queue: Arc<Queue>,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
    sink: ConsumerSink,
    active: AtomicBool,
}

impl Consumer {
    pub fn new(tag: ConsumerTag, queue: Arc<Queue>, options: ConsumeOptions, sink: ConsumerSink) -> Self {
        Self {
            tag,
            queue,
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            arguments: options.arguments,
            sink,
            active: AtomicBool::new(true),
        }
    }

    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            tag: self.tag.clone(),
            queue: self.queue.name().to_string(),
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            arguments: self.arguments.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the consumer cancelled. Returns `false` if it already was.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub fn deliver(&self, channel: &Channel, delivery: Delivery) -> Handoff {
        match &self.sink {
            ConsumerSink::Callback(callback) => {
                let mut callback = callback.lock();
                let handler = &mut **callback;
                handler(channel, delivery);
                Handoff::Delivered
            }
            ConsumerSink::Receiver(tx) => match tx.send(delivery) {
                Ok(()) => Handoff::Delivered,
                Err(_) => Handoff::SinkClosed,
            },
        }
    }
}
