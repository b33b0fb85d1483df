//! The `transport` module is the seam between the bus and a message broker.
//!
//! It defines the small slice of AMQP 0-9-1 the bus relies on (connections,
//! channels, declarations, publishing, consuming and settling deliveries) as
//! async traits. Two implementations exist: an in-process broker used by the
//! demo and the tests, and a RabbitMQ adapter behind the default `amqp` feature.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::watch;

use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::utils::error::BusError;

/// Header carrying how many times a message was re-enqueued after a failure.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Headers stamped on a message when a queue dead-letters it.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";
pub const DEATH_REASON_HEADER: &str = "x-death-reason";

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Redeclaration with parameters that differ from the existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::PreconditionFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Text(text) => text.parse().ok(),
        }
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A message on its way to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
    pub message_id: Option<String>,
    pub content_type: String,
}

impl OutgoingMessage {
    /// Persistent JSON message with no headers.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: Headers::new(),
            persistent: true,
            message_id: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_string(), value);
        self
    }
}

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message handed to a consumer. It stays unacknowledged on the broker until
/// `ack` or `reject` is called, or until its channel closes.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub persistent: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        headers: Headers,
        message_id: Option<String>,
        redelivered: bool,
        persistent: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange,
            routing_key,
            body,
            headers,
            message_id,
            redelivered,
            persistent,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }

    /// Value of the retry header, zero when absent or malformed.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(HeaderValue::as_int)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Health of one broker connection as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Flips to `LinkState::Closed` when the connection drops for any reason.
    fn state(&self) -> watch::Receiver<LinkState>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), TransportError>;

    /// Publish to `exchange`. The empty exchange name is the default exchange,
    /// which routes straight to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), TransportError>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Flips to `LinkState::Closed` when the channel is closed, by the client
    /// or by a broker-side channel exception, even if the connection is up.
    fn state(&self) -> watch::Receiver<LinkState>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Pick a transport from the broker URL scheme: `memory://` runs an
/// in-process broker, `amqp://` and `amqps://` go to RabbitMQ through the
/// `amqp` feature (on by default).
#[cfg_attr(not(feature = "amqp"), allow(unused_variables))]
pub fn from_url(url: &str, confirms: bool) -> Result<Arc<dyn Transport>, BusError> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(memory::InMemoryBroker::new())),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpTransport::new(confirms))),
        _ => Err(BusError::UnsupportedUrl(url.to_string())),
    }
}

/// Strip the password from a broker URL before it reaches a log line.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
