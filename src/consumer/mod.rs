//! Consuming side of the bus: handlers, the per-service registry and the
//! subscriber that drives one consumption loop per durable queue.
//!
//! Delivery is at-least-once. A handler may see the same `messageId` more
//! than once and must be idempotent on it or on a natural key;
//! [`dedup::Idempotent`] covers the common case.

pub mod dedup;
pub mod handler;
pub mod registry;
pub mod subscriber;

pub use dedup::{Idempotent, idempotent};
pub use handler::{EventHandler, HandlerError, HandlerResult, handler_fn, named, typed_handler};
pub use registry::{EventRegistry, Registration};
pub use subscriber::Subscriber;

#[cfg(test)]
mod tests;
