use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::connection::ConnectionId;
use crate::core::error::{BrokerError, Result};
use crate::core::message::{FieldTable, Message};

/// Flags for `declare_queue`.
#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    /// Only check that the queue exists.
    pub passive: bool,
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub fn passive() -> Self {
        Self {
            passive: true,
            ..Default::default()
        }
    }

    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Default::default()
        }
    }
}

/// Preconditions for `delete_queue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

/// Result of `declare_queue`: the resolved name plus current depth and
/// consumer count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A named FIFO message store.
///
/// All mutation goes through one mutex per queue, so producers and
/// consumers of different queues never contend.
#[derive(Debug)]
pub struct Queue {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    arguments: FieldTable,
    owner: Option<ConnectionId>,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    consumers: usize,
    exclusive_consumer: bool,
    deleted: bool,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>, options: &QueueDeclareOptions, owner: ConnectionId) -> Self {
        Self {
            name: name.into(),
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            arguments: options.arguments.clone(),
            owner: options.exclusive.then_some(owner),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn arguments(&self) -> &FieldTable {
        &self.arguments
    }

    /// Connection that owns this queue, for exclusive queues.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Fails with `ResourceLocked` if `conn` may not touch this queue.
    pub(crate) fn check_access(&self, conn: ConnectionId) -> Result<()> {
        match self.owner {
            Some(owner) if owner != conn => Err(BrokerError::ResourceLocked(format!(
                "cannot obtain exclusive access to locked queue '{}'",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Appends at the tail. Returns `false` if the queue was deleted
    /// concurrently and the message went nowhere.
    pub(crate) fn push(&self, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.deleted {
            return false;
        }
        state.messages.push_back(message);
        true
    }

    /// Puts a message back at the head, for deliveries that never reached
    /// their consumer.
    pub(crate) fn push_front(&self, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.deleted {
            return false;
        }
        state.messages.push_front(message);
        true
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        self.state.lock().messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Empties the queue, returning how many messages were dropped.
    pub(crate) fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.messages.len();
        state.messages.clear();
        count
    }

    /// Registers a consumer, enforcing consumer exclusivity.
    pub(crate) fn add_consumer(&self, exclusive: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.exclusive_consumer {
            return Err(BrokerError::AccessRefused(format!(
                "queue '{}' in exclusive use",
                self.name
            )));
        }
        if exclusive && state.consumers > 0 {
            return Err(BrokerError::AccessRefused(format!(
                "cannot obtain exclusive access to queue '{}', it already has consumers",
                self.name
            )));
        }
        state.consumers += 1;
        state.exclusive_consumer = exclusive;
        Ok(())
    }

    /// Deregisters a consumer and returns how many remain.
    pub(crate) fn remove_consumer(&self) -> usize {
        let mut state = self.state.lock();
        state.consumers = state.consumers.saturating_sub(1);
        if state.consumers == 0 {
            state.exclusive_consumer = false;
        }
        state.consumers
    }

    /// Checks the delete preconditions and marks the queue deleted in one
    /// step. Returns the number of messages discarded.
    pub(crate) fn mark_deleted(&self, options: QueueDeleteOptions) -> Result<usize> {
        let mut state = self.state.lock();
        if options.if_unused && state.consumers > 0 {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' in use",
                self.name
            )));
        }
        if options.if_empty && !state.messages.is_empty() {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' not empty",
                self.name
            )));
        }
        state.deleted = true;
        let count = state.messages.len();
        state.messages.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::BasicProperties;

    fn msg(body: &'static str) -> Message {
        Message::new("", "q", body, BasicProperties::default())
    }

    fn queue(options: QueueDeclareOptions) -> Queue {
        Queue::new("q", &options, ConnectionId::from_raw(1))
    }

    #[test]
    fn fifo_order() {
        let q = queue(QueueDeclareOptions::default());
        assert!(q.push(msg("a")));
        assert!(q.push(msg("b")));
        assert!(q.push_front(msg("z")));
        assert_eq!(q.len(), 3);

        let bodies: Vec<_> = std::iter::from_fn(|| q.pop()).map(|m| m.body).collect();
        assert_eq!(bodies, ["z", "a", "b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn purge_counts_removed_messages() {
        let q = queue(QueueDeclareOptions::default());
        for _ in 0..5 {
            q.push(msg("x"));
        }
        assert_eq!(q.purge(), 5);
        assert_eq!(q.purge(), 0);
    }

    #[test]
    fn deleted_queue_refuses_messages() {
        let q = queue(QueueDeclareOptions::default());
        q.push(msg("x"));
        assert_eq!(q.mark_deleted(QueueDeleteOptions::default()).unwrap(), 1);
        assert!(!q.push(msg("y")));
        assert!(q.is_deleted());
    }

    #[test]
    fn delete_preconditions() {
        let q = queue(QueueDeclareOptions::default());
        q.push(msg("x"));
        q.add_consumer(false).unwrap();

        let err = q
            .mark_deleted(QueueDeleteOptions {
                if_unused: true,
                if_empty: false,
            })
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));

        let err = q
            .mark_deleted(QueueDeleteOptions {
                if_unused: false,
                if_empty: true,
            })
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
        assert!(!q.is_deleted());
    }

    #[test]
    fn exclusive_consumer_locks_out_others() {
        let q = queue(QueueDeclareOptions::default());
        q.add_consumer(true).unwrap();
        assert!(matches!(q.add_consumer(false), Err(BrokerError::AccessRefused(_))));
        assert_eq!(q.remove_consumer(), 0);
        q.add_consumer(false).unwrap();
        assert!(matches!(q.add_consumer(true), Err(BrokerError::AccessRefused(_))));
        assert_eq!(q.consumer_count(), 1);
    }

    #[test]
    fn exclusive_queue_is_owned_by_its_connection() {
        let q = queue(QueueDeclareOptions::exclusive());
        assert_eq!(q.owner(), Some(ConnectionId::from_raw(1)));
        assert!(q.check_access(ConnectionId::from_raw(1)).is_ok());
        assert!(matches!(
            q.check_access(ConnectionId::from_raw(2)),
            Err(BrokerError::ResourceLocked(_))
        ));

        let shared = queue(QueueDeclareOptions::default());
        assert!(shared.owner().is_none());
        assert!(shared.check_access(ConnectionId::from_raw(2)).is_ok());
    }
}
