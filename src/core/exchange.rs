use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::core::error::BrokerError;
use crate::core::message::FieldTable;

/// Name of the nameless default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchanges every broker starts with, besides the default exchange.
pub(crate) const BUILTIN_EXCHANGES: &[(&str, ExchangeKind)] = &[
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
    ("amq.headers", ExchangeKind::Headers),
    ("amq.match", ExchangeKind::Headers),
];

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    /// Routed like fanout: header arguments are not evaluated.
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(BrokerError::InvalidArgument(format!(
                "unknown exchange type '{other}'"
            ))),
        }
    }
}

/// Flags for `declare_exchange`.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    /// Only check that the exchange exists.
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclareOptions {
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
}

/// A declared exchange. Never mutated after creation; a re-declare
/// replaces the table entry.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl Exchange {
    pub(crate) fn new(name: impl Into<String>, kind: ExchangeKind, options: &ExchangeDeclareOptions) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            arguments: options.arguments.clone(),
        }
    }

    pub(crate) fn builtin(name: &str, kind: ExchangeKind) -> Self {
        Self::new(name, kind, &ExchangeDeclareOptions::durable())
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }
}
