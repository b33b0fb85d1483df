//! Publishing side of the bus.
//!
//! `Publisher::publish` is fire-and-forget: it never buffers and reports
//! `false` when the broker is unreachable. `publish_reliable` goes through a
//! local `sled` outbox so an event survives both broker outages and process
//! restarts until the relay hands it over.

pub mod outbox;
pub mod publisher;

pub use outbox::Outbox;
pub use publisher::Publisher;
