//! TOML-driven broker configuration with environment overrides.
//!
//! Precedence: built-in defaults, then the file, then `HUTCH_*` variables.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::core::broker::BrokerConfig;
use crate::core::exchange::ExchangeKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub broker: BrokerConfig,
    pub topology: Topology,
}

/// Entities declared when the broker is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchanges: Vec<ExchangeEntry>,
    pub queues: Vec<QueueEntry>,
    pub bindings: Vec<BindingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeEntry {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingEntry {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    broker: FileBrokerConfig,
    topology: Topology,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileBrokerConfig {
    default_prefetch: Option<u16>,
    strict_acks: Option<bool>,
    auto_create_queues: Option<bool>,
    requeue_on_close: Option<bool>,
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Parse(format!("{var}: expected a boolean, got '{other}'"))),
    }
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::parse_file(&raw)
    }

    fn parse_file(raw: &str) -> Result<FileConfig, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Parses a TOML document directly, without environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Self::resolve(Self::parse_file(raw)?, |_| None)
    }

    /// Loads from `path`, or `HUTCH_CONFIG` when `path` is `None`, then
    /// applies environment overrides. Without either path the defaults
    /// are used.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Like [`Config::load`] but reads variables through `lookup`.
    pub fn load_with_env<F>(path: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let effective_path = path.map(str::to_string).or_else(|| lookup("HUTCH_CONFIG"));
        let file_cfg = match effective_path {
            Some(p) => {
                debug!(target: "hutch::config", path = %p, "loading configuration file");
                Self::load_file(p)?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file_cfg, lookup)
    }

    fn resolve<F>(file_cfg: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();
        let file = file_cfg.broker;

        let mut default_prefetch = file.default_prefetch.unwrap_or(defaults.default_prefetch);
        let mut strict_acks = file.strict_acks.unwrap_or(defaults.strict_acks);
        let mut auto_create_queues = file.auto_create_queues.unwrap_or(defaults.auto_create_queues);
        let mut requeue_on_close = file.requeue_on_close.unwrap_or(defaults.requeue_on_close);

        if let Some(v) = lookup("HUTCH_DEFAULT_PREFETCH") {
            default_prefetch = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::Parse(format!("HUTCH_DEFAULT_PREFETCH: {e}")))?;
        }
        if let Some(v) = lookup("HUTCH_STRICT_ACKS") {
            strict_acks = parse_bool("HUTCH_STRICT_ACKS", &v)?;
        }
        if let Some(v) = lookup("HUTCH_AUTO_CREATE_QUEUES") {
            auto_create_queues = parse_bool("HUTCH_AUTO_CREATE_QUEUES", &v)?;
        }
        if let Some(v) = lookup("HUTCH_REQUEUE_ON_CLOSE") {
            requeue_on_close = parse_bool("HUTCH_REQUEUE_ON_CLOSE", &v)?;
        }

        Ok(Config {
            broker: BrokerConfig {
                default_prefetch,
                strict_acks,
                auto_create_queues,
                requeue_on_close,
            },
            topology: file_cfg.topology,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = Config::load_with_env(None, env_of(&[])).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.broker.requeue_on_close);
    }

    #[test]
    fn file_values_and_topology_are_read() {
        let cfg = Config::from_toml_str(
            r#"
            [broker]
            default_prefetch = 10
            strict_acks = true

            [[topology.exchanges]]
            name = "logs"
            kind = "topic"

            [[topology.queues]]
            name = "errors"
            durable = true

            [[topology.bindings]]
            queue = "errors"
            exchange = "logs"
            routing_key = "*.error"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.broker.default_prefetch, 10);
        assert!(cfg.broker.strict_acks);
        assert!(cfg.broker.requeue_on_close);
        assert_eq!(cfg.topology.exchanges[0].kind, ExchangeKind::Topic);
        assert!(cfg.topology.queues[0].durable);
        assert_eq!(cfg.topology.bindings[0].routing_key, "*.error");
    }

    #[test]
    fn env_overrides_file() {
        let cfg = Config::resolve(
            Config::parse_file("[broker]\ndefault_prefetch = 10\n").unwrap(),
            env_of(&[("HUTCH_DEFAULT_PREFETCH", "3"), ("HUTCH_REQUEUE_ON_CLOSE", "off")]),
        )
        .unwrap();
        assert_eq!(cfg.broker.default_prefetch, 3);
        assert!(!cfg.broker.requeue_on_close);
    }

    #[test]
    fn malformed_env_names_the_variable() {
        let err = Config::load_with_env(None, env_of(&[("HUTCH_STRICT_ACKS", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(ref msg) if msg.starts_with("HUTCH_STRICT_ACKS")));

        let err = Config::load_with_env(None, env_of(&[("HUTCH_DEFAULT_PREFETCH", "-1")])).unwrap_err();
        assert!(err.to_string().contains("HUTCH_DEFAULT_PREFETCH"));
    }

    #[test]
    fn unknown_exchange_kind_is_a_toml_error() {
        let err = Config::from_toml_str(
            "[[topology.exchanges]]\nname = \"x\"\nkind = \"random\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load_with_env(Some("/nonexistent/hutch.toml"), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
