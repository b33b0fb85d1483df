//! Broker topology: the shared topic exchange, per-subscription durable
//! queues, their bindings and the dead-letter side.

pub mod declarator;
pub mod pattern;

pub use declarator::{
    BindingSpec, ExchangeKind, ExchangeSpec, QueueArguments, QueueSpec, SubscriptionTopology,
    TopologyDeclarator, queue_name,
};
pub use pattern::RoutingPattern;
