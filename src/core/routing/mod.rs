//! Routing module: topic pattern matching and the binding table that
//! resolves `(exchange, routing key)` to destination queues.

pub mod bindings;
pub mod matcher;

pub use bindings::BindingTable;
pub use matcher::topic_matches;
