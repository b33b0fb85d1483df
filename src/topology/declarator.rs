//! Topology declaration.
//!
//! Declarations are idempotent: the broker ignores a redeclaration with
//! identical parameters. A redeclaration with different type, durability or
//! arguments is a configuration error; it is reported as
//! `BusError::Topology` and must stop the process at startup.

use std::time::Duration;

use tracing::debug;

use super::pattern::RoutingPattern;
use crate::config::Settings;
use crate::transport::{Channel, TransportError};
use crate::utils::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Optional `x-` arguments carried by a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Everything one subscription needs on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTopology {
    pub queue: QueueSpec,
    pub binding: BindingSpec,
    pub dead_letter: Option<(QueueSpec, BindingSpec)>,
}

/// Deterministic queue name: `{service}-{pattern}`, or
/// `{service}-{pattern}-{handler}` for a named handler.
pub fn queue_name(service: &str, pattern: &RoutingPattern, handler: Option<&str>) -> String {
    match handler {
        Some(handler) => format!("{service}-{pattern}-{handler}"),
        None => format!("{service}-{pattern}"),
    }
}

#[derive(Debug, Clone)]
pub struct TopologyDeclarator {
    exchange: ExchangeSpec,
    dead_letter_exchange: Option<ExchangeSpec>,
    message_ttl: Option<Duration>,
}

impl TopologyDeclarator {
    pub fn new(exchange: &str, dead_letter: bool, message_ttl: Option<Duration>) -> Self {
        let dead_letter_exchange = dead_letter.then(|| ExchangeSpec {
            name: format!("{exchange}.dlx"),
            kind: ExchangeKind::Direct,
            durable: true,
        });

        Self {
            exchange: ExchangeSpec {
                name: exchange.to_string(),
                kind: ExchangeKind::Topic,
                durable: true,
            },
            dead_letter_exchange,
            message_ttl,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.broker.exchange,
            settings.consumer.dead_letter,
            settings.consumer.message_ttl_secs.map(Duration::from_secs),
        )
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn dead_letter_exchange(&self) -> Option<&ExchangeSpec> {
        self.dead_letter_exchange.as_ref()
    }

    /// Describe the queue, binding and dead-letter queue for `queue`.
    pub fn subscription(&self, queue: &str, pattern: &RoutingPattern) -> SubscriptionTopology {
        let mut arguments = QueueArguments {
            message_ttl_ms: self.message_ttl.map(|ttl| ttl.as_millis() as u64),
            ..Default::default()
        };

        let dead_letter = self.dead_letter_exchange.as_ref().map(|dlx| {
            arguments.dead_letter_exchange = Some(dlx.name.clone());
            arguments.dead_letter_routing_key = Some(queue.to_string());

            let dead_queue = QueueSpec {
                name: format!("{queue}.dead"),
                durable: true,
                arguments: QueueArguments::default(),
            };
            let dead_binding = BindingSpec {
                queue: dead_queue.name.clone(),
                exchange: dlx.name.clone(),
                routing_key: queue.to_string(),
            };
            (dead_queue, dead_binding)
        });

        SubscriptionTopology {
            queue: QueueSpec {
                name: queue.to_string(),
                durable: true,
                arguments,
            },
            binding: BindingSpec {
                queue: queue.to_string(),
                exchange: self.exchange.name.clone(),
                routing_key: pattern.as_str().to_string(),
            },
            dead_letter,
        }
    }

    /// Declare the shared exchange and, when enabled, the dead-letter exchange.
    pub async fn declare_exchange(&self, channel: &dyn Channel) -> Result<(), BusError> {
        channel
            .declare_exchange(&self.exchange)
            .await
            .map_err(topology_error)?;
        if let Some(dlx) = &self.dead_letter_exchange {
            channel.declare_exchange(dlx).await.map_err(topology_error)?;
        }
        debug!(exchange = %self.exchange.name, "exchange declared");
        Ok(())
    }

    /// Declare the dead-letter queue first so nothing rejected from the main
    /// queue can be lost, then the main queue and its binding.
    pub async fn declare_subscription(
        &self,
        channel: &dyn Channel,
        topology: &SubscriptionTopology,
    ) -> Result<(), BusError> {
        if let Some((dead_queue, dead_binding)) = &topology.dead_letter {
            channel.declare_queue(dead_queue).await.map_err(topology_error)?;
            channel.bind_queue(dead_binding).await.map_err(topology_error)?;
        }
        channel
            .declare_queue(&topology.queue)
            .await
            .map_err(topology_error)?;
        channel
            .bind_queue(&topology.binding)
            .await
            .map_err(topology_error)?;

        debug!(
            queue = %topology.queue.name,
            pattern = %topology.binding.routing_key,
            "subscription topology declared"
        );
        Ok(())
    }
}

fn topology_error(err: TransportError) -> BusError {
    match err {
        TransportError::PreconditionFailed(reason) => BusError::Topology(reason),
        other => BusError::Transport(other),
    }
}
