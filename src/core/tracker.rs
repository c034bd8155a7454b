//! Per-channel bookkeeping of delivered-but-unacknowledged messages.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::core::message::{DeliveryTag, Message};

/// A delivery awaiting ack/nack/reject.
#[derive(Debug, Clone)]
pub struct Unacked {
    /// Queue the message was taken from; requeues go back there.
    pub queue: String,
    pub message: Message,
}

/// Issues delivery tags for one channel and remembers which ones are
/// still outstanding.
///
/// Tags start at 1 and only ever grow. Outstanding deliveries are kept in
/// tag order so `multiple` resolutions come out ascending.
#[derive(Debug)]
pub struct DeliveryTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    next_tag: u64,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                next_tag: 1,
                unacked: BTreeMap::new(),
            }),
        }
    }

    /// Reserves the next tag. Auto-ack deliveries take a tag too but are
    /// never tracked.
    pub fn next_tag(&self) -> DeliveryTag {
        let mut inner = self.inner.lock();
        let tag = DeliveryTag::from_raw(inner.next_tag);
        inner.next_tag += 1;
        tag
    }

    /// Records `message` as delivered-unacked under `tag`.
    pub fn track(&self, tag: DeliveryTag, queue: impl Into<String>, message: Message) {
        let entry = Unacked {
            queue: queue.into(),
            message,
        };
        self.inner.lock().unacked.insert(tag, entry);
    }

    /// Removes and returns the deliveries addressed by `(tag, multiple)`,
    /// ascending by tag.
    ///
    /// With `multiple`, every outstanding tag `<= tag` is resolved, and tag
    /// 0 means all of them. Without it only the exact tag is. Unknown tags
    /// yield an empty result.
    pub fn resolve(&self, tag: DeliveryTag, multiple: bool) -> Vec<(DeliveryTag, Unacked)> {
        let mut inner = self.inner.lock();
        if !multiple {
            return inner
                .unacked
                .remove(&tag)
                .map(|entry| vec![(tag, entry)])
                .unwrap_or_default();
        }

        if tag.value() == 0 {
            return std::mem::take(&mut inner.unacked).into_iter().collect();
        }

        let Some(bound) = tag.value().checked_add(1) else {
            return std::mem::take(&mut inner.unacked).into_iter().collect();
        };
        let rest = inner.unacked.split_off(&DeliveryTag::from_raw(bound));
        let resolved = std::mem::replace(&mut inner.unacked, rest);
        resolved.into_iter().collect()
    }

    /// Removes everything outstanding, ascending by tag.
    pub fn drain(&self) -> Vec<(DeliveryTag, Unacked)> {
        self.resolve(DeliveryTag::from_raw(0), true)
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.inner.lock().unacked.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding tags, ascending.
    pub fn tags(&self) -> Vec<DeliveryTag> {
        self.inner.lock().unacked.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::BasicProperties;

    fn deliver(tracker: &DeliveryTracker, body: &'static str) -> DeliveryTag {
        let tag = tracker.next_tag();
        tracker.track(tag, "q", Message::new("", "q", body, BasicProperties::default()));
        tag
    }

    fn raw(tags: &[(DeliveryTag, Unacked)]) -> Vec<u64> {
        tags.iter().map(|(tag, _)| tag.value()).collect()
    }

    #[test]
    fn tags_increase_from_one() {
        let tracker = DeliveryTracker::new();
        assert_eq!(tracker.next_tag().value(), 1);
        assert_eq!(tracker.next_tag().value(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn single_resolve_removes_only_that_tag() {
        let tracker = DeliveryTracker::new();
        let t1 = deliver(&tracker, "a");
        let t2 = deliver(&tracker, "b");

        let resolved = tracker.resolve(t2, false);
        assert_eq!(raw(&resolved), [2]);
        assert_eq!(resolved[0].1.message.body, "b");
        assert!(tracker.contains(t1));
        assert!(tracker.resolve(t2, false).is_empty());
    }

    #[test]
    fn multiple_resolves_everything_up_to_tag() {
        let tracker = DeliveryTracker::new();
        for body in ["a", "b", "c", "d"] {
            deliver(&tracker, body);
        }

        let resolved = tracker.resolve(DeliveryTag::from_raw(3), true);
        assert_eq!(raw(&resolved), [1, 2, 3]);
        assert_eq!(tracker.tags(), [DeliveryTag::from_raw(4)]);
    }

    #[test]
    fn multiple_with_zero_resolves_all() {
        let tracker = DeliveryTracker::new();
        deliver(&tracker, "a");
        deliver(&tracker, "b");
        assert_eq!(raw(&tracker.resolve(DeliveryTag::from_raw(0), true)), [1, 2]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn multiple_with_max_tag_resolves_all() {
        let tracker = DeliveryTracker::new();
        deliver(&tracker, "a");
        deliver(&tracker, "b");
        let resolved = tracker.resolve(DeliveryTag::from_raw(u64::MAX), true);
        assert_eq!(raw(&resolved), [1, 2]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn single_max_tag_is_unknown() {
        let tracker = DeliveryTracker::new();
        deliver(&tracker, "a");
        assert!(tracker.resolve(DeliveryTag::from_raw(u64::MAX), false).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn untracked_tags_are_skipped() {
        let tracker = DeliveryTracker::new();
        deliver(&tracker, "a");
        let _auto_ack = tracker.next_tag();
        deliver(&tracker, "c");

        assert_eq!(raw(&tracker.drain()), [1, 3]);
        assert!(tracker.drain().is_empty());
    }
}
