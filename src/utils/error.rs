//! Crate-wide error type.
//!
//! Transport failures are recovered by the connection manager and only reach
//! callers as transient failures; `Topology` errors are fatal configuration
//! problems and are never retried.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Conflicting redeclaration of an exchange or queue. Fail fast.
    #[error("fatal topology error: {0}")]
    Topology(String),

    #[error("invalid event name '{0}'")]
    InvalidEventName(String),

    #[error("invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("queue '{0}' is already registered for this service")]
    DuplicateSubscription(String),

    #[error("not connected to the broker")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("outbox storage error: {0}")]
    Outbox(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("unsupported broker url '{0}'")]
    UnsupportedUrl(String),

    #[error("registry belongs to service '{found}', bus runs as '{expected}'")]
    ServiceMismatch { expected: String, found: String },

    #[error("reliable publishing requires the outbox to be enabled")]
    OutboxDisabled,

    #[error("event bus is shutting down")]
    ShuttingDown,
}

impl BusError {
    /// Fatal errors stop the reconnect loop instead of being retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            BusError::Topology(_)
            | BusError::Config(_)
            | BusError::UnsupportedUrl(_)
            | BusError::InvalidPattern { .. }
            | BusError::DuplicateSubscription(_)
            | BusError::ServiceMismatch { .. } => true,
            BusError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}
