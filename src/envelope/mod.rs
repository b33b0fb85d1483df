//! Event envelope and the shared event vocabulary.
//!
//! The envelope is the unit on the wire: a JSON object carrying the event
//! name (which doubles as the routing key), the domain payload, creation time,
//! the publishing service and a per-publish message id.

pub mod envelope;
pub mod schema;

pub use envelope::{EventEnvelope, MonotonicClock, Payload, validate_event_name};
pub use schema::DomainEvent;

#[cfg(test)]
mod tests;
