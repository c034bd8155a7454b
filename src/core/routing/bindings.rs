use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::exchange::ExchangeKind;
use crate::core::routing::matcher::topic_matches;

type QueueSet = BTreeSet<String>;

/// `(exchange, binding key) -> {queue}` table.
///
/// Keys are grouped per exchange so fanout and topic routing only walk the
/// bindings of the exchange being published to.
#[derive(Debug, Default)]
pub struct BindingTable {
    by_exchange: HashMap<String, BTreeMap<String, QueueSet>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `queue` under `(exchange, key)`. Returns `false` if it was
    /// already bound there.
    pub fn bind(&mut self, exchange: &str, key: &str, queue: &str) -> bool {
        self.by_exchange
            .entry(exchange.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(queue.to_string())
    }

    /// Removes `queue` from `(exchange, key)`. Returns `false` if absent.
    pub fn unbind(&mut self, exchange: &str, key: &str, queue: &str) -> bool {
        let Some(keys) = self.by_exchange.get_mut(exchange) else {
            return false;
        };
        let Some(queues) = keys.get_mut(key) else {
            return false;
        };
        let removed = queues.remove(queue);
        if queues.is_empty() {
            keys.remove(key);
        }
        if keys.is_empty() {
            self.by_exchange.remove(exchange);
        }
        removed
    }

    pub fn contains(&self, exchange: &str, key: &str, queue: &str) -> bool {
        self.by_exchange
            .get(exchange)
            .and_then(|keys| keys.get(key))
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Whether any binding has `exchange` as its source.
    pub fn has_bindings(&self, exchange: &str) -> bool {
        self.by_exchange.contains_key(exchange)
    }

    /// Drops every binding that targets `queue`, returning the exchanges
    /// that were left with no bindings at all.
    pub fn remove_queue(&mut self, queue: &str) -> Vec<String> {
        let mut emptied = Vec::new();
        self.by_exchange.retain(|exchange, keys| {
            keys.retain(|_, queues| {
                queues.remove(queue);
                !queues.is_empty()
            });
            if keys.is_empty() {
                emptied.push(exchange.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// Drops every binding whose source is `exchange`.
    pub fn remove_exchange(&mut self, exchange: &str) -> usize {
        self.by_exchange
            .remove(exchange)
            .map(|keys| keys.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }

    /// Total number of `(exchange, key, queue)` bindings.
    pub fn len(&self) -> usize {
        self.by_exchange
            .values()
            .flat_map(|keys| keys.values())
            .map(BTreeSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_exchange.is_empty()
    }

    /// Queues a message published to `exchange` of the given kind with
    /// `routing_key` should reach. De-duplicated by queue name.
    pub fn route(&self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> QueueSet {
        let Some(keys) = self.by_exchange.get(exchange) else {
            return QueueSet::new();
        };

        match kind {
            ExchangeKind::Direct => keys.get(routing_key).cloned().unwrap_or_default(),
            ExchangeKind::Fanout | ExchangeKind::Headers => {
                keys.values().flatten().cloned().collect()
            }
            ExchangeKind::Topic => keys
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, routing_key))
                .flat_map(|(_, queues)| queues.iter().cloned())
                .collect(),
        }
    }

    /// Every binding as `(exchange, key, queue)`, in a stable order.
    pub fn entries(&self) -> Vec<(String, String, String)> {
        let mut out: Vec<_> = self
            .by_exchange
            .iter()
            .flat_map(|(exchange, keys)| {
                keys.iter().flat_map(move |(key, queues)| {
                    queues
                        .iter()
                        .map(move |queue| (exchange.clone(), key.clone(), queue.clone()))
                })
            })
            .collect();
        out.sort();
        out
    }
}
