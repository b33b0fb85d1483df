use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::outbox::Outbox;
use crate::connection::{ConnectionManager, until_stopped};
use crate::envelope::{DomainEvent, EventEnvelope, MonotonicClock, Payload};
use crate::transport::OutgoingMessage;
use crate::utils::error::BusError;

/// Publishes envelopes to the shared topic exchange, routing key = event name.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    exchange: String,
    source: String,
    publish_timeout: Duration,
    clock: MonotonicClock,
    outbox: Option<Outbox>,
    /// Held for a whole outbox pass so no entry is read and sent twice.
    draining: Mutex<()>,
}

impl Publisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        exchange: &str,
        source: &str,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            exchange: exchange.to_string(),
            source: source.to_string(),
            publish_timeout,
            clock: MonotonicClock::new(),
            outbox: None,
            draining: Mutex::new(()),
        }
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        self.outbox.as_ref()
    }

    /// Returns `true` once the broker has accepted the event. Invalid names,
    /// a missing connection, broker errors and timeouts all give `false`
    /// with a warning; nothing is buffered.
    pub async fn publish(&self, event_name: &str, data: Payload) -> bool {
        let envelope = match EventEnvelope::new(event_name, data, &self.source, self.clock.now()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event = event_name, error = %e, "event not published");
                return false;
            }
        };
        self.send(&envelope).await.is_ok()
    }

    /// Publish a typed event under its own name and schema version.
    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> bool {
        let data = match serde_json::to_value(event) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(event = E::NAME, "event payload must serialize to a JSON object");
                return false;
            }
            Err(e) => {
                warn!(event = E::NAME, error = %e, "event payload failed to serialize");
                return false;
            }
        };

        match EventEnvelope::new(E::NAME, data, &self.source, self.clock.now()) {
            Ok(envelope) => self.send(&envelope.with_version(E::VERSION)).await.is_ok(),
            Err(e) => {
                warn!(event = E::NAME, error = %e, "event not published");
                false
            }
        }
    }

    /// Store the event in the outbox, then drain the outbox right away,
    /// older entries first. Whatever is not delivered now is left for the
    /// relay. Returns the message id.
    pub async fn publish_reliable(&self, event_name: &str, data: Payload) -> Result<String, BusError> {
        let outbox = self.outbox.as_ref().ok_or(BusError::OutboxDisabled)?;
        let envelope = EventEnvelope::new(event_name, data, &self.source, self.clock.now())?;
        outbox.enqueue(&envelope)?;

        self.relay_outbox().await?;
        Ok(envelope.message_id().unwrap_or_default().to_string())
    }

    /// Publish one envelope as is.
    pub async fn send(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let event = envelope.event_name();
        let Some(channel) = self.connection.channel() else {
            warn!(event, "not connected to the broker, event not published");
            return Err(BusError::NotConnected);
        };

        let mut message = OutgoingMessage::json(envelope.to_bytes()?);
        if let Some(id) = envelope.message_id() {
            message = message.with_message_id(id);
        }

        match tokio::time::timeout(
            self.publish_timeout,
            channel.publish(&self.exchange, event, message),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(event, message_id = envelope.message_id(), "event published");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(event, error = %e, "event not published");
                Err(e.into())
            }
            Err(_) => {
                warn!(event, timeout_ms = self.publish_timeout.as_millis() as u64, "publish timed out");
                Err(BusError::Timeout(self.publish_timeout))
            }
        }
    }

    /// Drain the outbox in insertion order. Stops at the first failure so
    /// later events never overtake earlier ones. Returns how many were sent.
    pub async fn relay_outbox(&self) -> Result<usize, BusError> {
        let Some(outbox) = &self.outbox else {
            return Ok(0);
        };
        let _pass = self.draining.lock().await;

        let mut relayed = 0;
        for (key, envelope) in outbox.pending()? {
            if self.send(&envelope).await.is_err() {
                outbox.record_attempt(&key)?;
                break;
            }
            outbox.remove(&key)?;
            relayed += 1;
        }
        if relayed > 0 {
            info!(relayed, remaining = outbox.len(), "outbox relayed");
        }
        Ok(relayed)
    }

    /// Background relay: every `interval`, while connected, drain the
    /// outbox. Runs until `stop` flips to `true`.
    pub async fn run_relay(self: Arc<Self>, interval: Duration, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = until_stopped(&mut stop) => {
                    debug!("outbox relay stopped");
                    return;
                }
            }

            if !self.connection.is_connected() {
                continue;
            }
            if let Err(e) = self.relay_outbox().await {
                warn!(error = %e, "outbox relay pass failed");
            }
        }
    }
}
