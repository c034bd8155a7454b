pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod routing;
pub mod tracker;
