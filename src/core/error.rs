use std::fmt;

use thiserror::Error;

/// What kind of entity a [`BrokerError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Exchange,
    Queue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Exchange => f.write_str("exchange"),
            EntityKind::Queue => f.write_str("queue"),
        }
    }
}

/// Every failure an in-process broker operation can report.
///
/// Errors are returned to the immediate caller and never retried
/// internally. [`BrokerError::reply_code`] gives the matching AMQP 0-9-1
/// reply code for callers that want to mimic a real broker's closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("NOT_FOUND - no {kind} '{name}'")]
    NotFound { kind: EntityKind, name: String },

    #[error("channel {0} is closed")]
    ChannelClosed(u16),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("NO_ROUTE - message to exchange '{exchange}' with routing key '{routing_key}' is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("PRECONDITION_FAILED - {0}")]
    PreconditionFailed(String),

    #[error("ACCESS_REFUSED - {0}")]
    AccessRefused(String),

    #[error("RESOURCE_LOCKED - {0}")]
    ResourceLocked(String),

    #[error("PRECONDITION_FAILED - unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

impl BrokerError {
    pub(crate) fn exchange_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: EntityKind::Exchange,
            name: name.to_string(),
        }
    }

    pub(crate) fn queue_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: EntityKind::Queue,
            name: name.to_string(),
        }
    }

    /// AMQP 0-9-1 reply code for this error.
    pub fn reply_code(&self) -> u16 {
        match self {
            BrokerError::NotFound { .. } => 404,
            BrokerError::ChannelClosed(_) => 504,
            BrokerError::ConnectionClosed => 320,
            BrokerError::Unroutable { .. } => 312,
            BrokerError::InvalidArgument(_) => 503,
            BrokerError::PreconditionFailed(_) => 406,
            BrokerError::AccessRefused(_) => 403,
            BrokerError::ResourceLocked(_) => 405,
            BrokerError::UnknownDeliveryTag(_) => 406,
        }
    }

    /// `true` for errors raised because the channel or its connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed(_) | BrokerError::ConnectionClosed
        )
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_entity() {
        let err = BrokerError::queue_not_found("orders");
        assert_eq!(err.to_string(), "NOT_FOUND - no queue 'orders'");
        assert_eq!(err.reply_code(), 404);

        let err = BrokerError::exchange_not_found("events");
        assert_eq!(err.to_string(), "NOT_FOUND - no exchange 'events'");
    }

    #[test]
    fn reply_codes_follow_amqp() {
        assert_eq!(BrokerError::ChannelClosed(1).reply_code(), 504);
        assert_eq!(BrokerError::ConnectionClosed.reply_code(), 320);
        assert_eq!(
            BrokerError::Unroutable {
                exchange: "x".into(),
                routing_key: "k".into()
            }
            .reply_code(),
            312
        );
        assert_eq!(BrokerError::UnknownDeliveryTag(9).reply_code(), 406);
        assert!(BrokerError::ConnectionClosed.is_closed());
        assert!(!BrokerError::InvalidArgument("x".into()).is_closed());
    }
}
