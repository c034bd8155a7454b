//! Connections: the top-level session handle applications open against a
//! [`Broker`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::broker::Broker;
use crate::core::channel::Channel;
use crate::core::error::{BrokerError, Result};

/// Identifies one connection for queue ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Owner of entities declared outside any connection (configured
    /// topology, direct [`Broker`] calls).
    pub const SYSTEM: ConnectionId = ConnectionId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Username/password pair. Accepted and recorded, never verified.
#[derive(Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
}

impl PlainCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for PlainCredentials {
    fn default() -> Self {
        Self::new("guest", "guest")
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Client-side connection settings. Host and port identify the session in
/// logs; nothing is dialled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub credentials: PlainCredentials,
    /// Heartbeat interval in seconds, recorded only.
    pub heartbeat: u16,
    pub connection_name: Option<String>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            credentials: PlainCredentials::default(),
            heartbeat: 60,
            connection_name: None,
        }
    }
}

impl ConnectionParameters {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: PlainCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// `user@host:port/vhost`, used in log lines.
    pub fn identity(&self) -> String {
        let sep = if self.virtual_host.starts_with('/') { "" } else { "/" };
        format!(
            "{}@{}:{}{}{}",
            self.credentials.username, self.host, self.port, sep, self.virtual_host
        )
    }
}

/// State shared between a connection and its channels.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub id: ConnectionId,
    pub identity: String,
    closed: AtomicBool,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ChannelTable {
    last: u16,
    open: BTreeMap<u16, Channel>,
}

impl ChannelTable {
    fn prune(&mut self) {
        self.open.retain(|_, channel| channel.is_open());
    }

    /// Next free number after the last one handed out, wrapping and
    /// skipping 0.
    fn allocate(&mut self) -> Option<u16> {
        let mut candidate = self.last;
        for _ in 0..u16::MAX {
            candidate = candidate.checked_add(1).unwrap_or(1);
            if !self.open.contains_key(&candidate) {
                self.last = candidate;
                return Some(candidate);
            }
        }
        None
    }
}

/// An open session on a broker. Closing it (explicitly or by drop) closes
/// every channel and deletes the exclusive queues it owns.
pub struct Connection {
    state: Arc<ConnectionState>,
    broker: Arc<Broker>,
    parameters: ConnectionParameters,
    channels: Mutex<ChannelTable>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.state.id)
            .field("identity", &self.state.identity)
            .field("closed", &self.is_closed())
            .field("channels", &self.channels.lock().open.len())
            .finish()
    }
}

impl Connection {
    pub fn open(broker: Arc<Broker>, parameters: ConnectionParameters) -> Self {
        let id = broker.next_connection_id();
        let identity = parameters.identity();
        info!(
            target: "hutch::connection",
            connection = %identity,
            id = %id,
            name = parameters.connection_name.as_deref().unwrap_or(""),
            "connection opened"
        );
        Self {
            state: Arc::new(ConnectionState {
                id,
                identity,
                closed: AtomicBool::new(false),
            }),
            broker,
            parameters,
            channels: Mutex::new(ChannelTable::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Opens a channel on the next free number.
    pub fn channel(&self) -> Result<Channel> {
        self.check_open()?;
        let mut table = self.channels.lock();
        table.prune();
        let number = table.allocate().ok_or_else(|| {
            BrokerError::InvalidArgument("no free channel numbers".to_string())
        })?;
        Ok(self.register(&mut table, number))
    }

    /// Opens a channel with a caller-chosen number. 0 is reserved.
    pub fn channel_with_number(&self, number: u16) -> Result<Channel> {
        self.check_open()?;
        if number == 0 {
            return Err(BrokerError::InvalidArgument(
                "channel number 0 is reserved".to_string(),
            ));
        }
        let mut table = self.channels.lock();
        table.prune();
        if table.open.contains_key(&number) {
            return Err(BrokerError::InvalidArgument(format!(
                "channel {number} is already open"
            )));
        }
        Ok(self.register(&mut table, number))
    }

    fn register(&self, table: &mut ChannelTable, number: u16) -> Channel {
        let channel = Channel::new(number, Arc::clone(&self.broker), Arc::clone(&self.state));
        table.open.insert(number, channel.clone());
        debug!(target: "hutch::connection", connection = %self.state.identity, channel = number, "channel opened");
        channel
    }

    /// Open channels, by number.
    pub fn channels(&self) -> Vec<Channel> {
        let mut table = self.channels.lock();
        table.prune();
        table.open.values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Pumps every open channel once and returns the total number of
    /// deliveries made. See [`Channel::pump`] for what one call delivers.
    pub fn process_data_events(&self) -> Result<usize> {
        self.check_open()?;
        let mut delivered = 0;
        for channel in self.channels() {
            match channel.pump() {
                Ok(count) => delivered += count,
                Err(BrokerError::ChannelClosed(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(delivered)
    }

    /// Closes every channel, then deletes the exclusive queues this
    /// connection declared. Idempotent.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels = std::mem::take(&mut self.channels.lock().open);
        for channel in channels.values() {
            channel.close();
        }
        let dropped = self.broker.drop_exclusive_queues(self.state.id);
        self.broker.wake();

        info!(
            target: "hutch::connection",
            connection = %self.state.identity,
            channels = channels.len(),
            exclusive_queues = dropped,
            "connection closed"
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
