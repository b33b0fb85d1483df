//! # topicbus
//!
//! `topicbus` is an event bus for services that share one topic exchange.
//! Each service publishes domain events such as `booking.confirmed`, and
//! subscribes to the patterns it cares about (`booking.*`, `payment.#`)
//! through its own durable queues.
//!
//! ## Core Modules
//!
//! - `envelope`: the JSON wire envelope and the shared event vocabulary.
//! - `topology`: exchange, queue, binding and dead-letter declarations.
//! - `transport`: the broker seam, with an in-process broker and a RabbitMQ
//!   adapter behind the default `amqp` feature.
//! - `connection`: one supervised broker link with reconnect and backoff.
//! - `publisher`: fire-and-forget publishing plus a durable outbox.
//! - `consumer`: handlers, the per-service registry and the subscriber.
//! - `bus`: the `EventBus` facade tying them together.
//! - `config`: layered settings loading.
//! - `utils`: error type and logging setup.
//!
//! Delivery is at-least-once. Handlers must tolerate duplicates, and state
//! transitions that must happen should not depend on the bus alone.

pub mod bus;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod publisher;
pub mod topology;
pub mod transport;
pub mod utils;

pub use bus::EventBus;
pub use consumer::{EventHandler, EventRegistry, HandlerError, HandlerResult};
pub use envelope::{EventEnvelope, Payload};
pub use utils::error::BusError;

#[cfg(test)]
mod tests;
