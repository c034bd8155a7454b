use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::consumer::ConsumerTag;

/// Opaque key/value bag used for message headers and declare arguments.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A single value inside a [`FieldTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Array(Vec<FieldValue>),
    Table(FieldTable),
    Void,
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Per-channel identifier of a delivered message, used by ack/nack/reject.
///
/// Tags start at 1; `DeliveryTag::from_raw(0)` combined with `multiple`
/// addresses every outstanding delivery on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        DeliveryTag(value)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `basic` class content properties. Passed through untouched, except
/// that a missing `timestamp` is stamped at publish time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: FieldTable,
    /// 1 = transient, 2 = persistent. Recorded only; nothing is persisted.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl BasicProperties {
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: u8) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn with_reply_to(mut self, value: impl Into<String>) -> Self {
        self.reply_to = Some(value.into());
        self
    }

    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = Some(value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(2)
    }
}

/// Immutable envelope stored on a queue.
///
/// Properties are shared behind an `Arc` and the body is `Bytes`, so the
/// per-queue copies made by fan-out routing are cheap.
#[derive(Debug, Clone)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub properties: Arc<BasicProperties>,
    pub redelivered: bool,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
        mut properties: BasicProperties,
    ) -> Self {
        if properties.timestamp.is_none() {
            properties.timestamp = Some(current_timestamp());
        }
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            properties: Arc::new(properties),
            redelivered: false,
        }
    }

    /// Copy of this message flagged for redelivery.
    pub(crate) fn into_redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }
}

/// What a consumer callback or `get` receives.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    /// `None` for deliveries made by `get`.
    pub consumer_tag: Option<ConsumerTag>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Arc<BasicProperties>,
    pub body: Bytes,
}

impl Delivery {
    pub(crate) fn new(tag: DeliveryTag, consumer_tag: Option<ConsumerTag>, message: &Message) -> Self {
        Self {
            delivery_tag: tag,
            consumer_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            properties: Arc::clone(&message.properties),
            body: message.body.clone(),
        }
    }
}

pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_stamps_missing_timestamp() {
        let msg = Message::new("", "q", "hi", BasicProperties::default());
        assert!(msg.properties.timestamp.is_some());

        let msg = Message::new(
            "",
            "q",
            "hi",
            BasicProperties {
                timestamp: Some(42),
                ..Default::default()
            },
        );
        assert_eq!(msg.properties.timestamp, Some(42));
        assert!(!msg.redelivered);
    }

    #[test]
    fn builder_sets_properties() {
        let props = BasicProperties::default()
            .with_content_type("application/json")
            .with_delivery_mode(2)
            .with_correlation_id("abc123")
            .with_header("x-retries", 3i64);

        assert!(props.is_persistent());
        assert_eq!(props.correlation_id.as_deref(), Some("abc123"));
        assert_eq!(props.headers.get("x-retries"), Some(&FieldValue::Int(3)));
    }

    #[test]
    fn fanout_copies_share_body_and_properties() {
        let msg = Message::new("ex", "k", Bytes::from_static(b"payload"), BasicProperties::default());
        let copy = msg.clone();
        assert!(Arc::ptr_eq(&msg.properties, &copy.properties));
        assert!(copy.into_redelivered().redelivered);
    }
}
