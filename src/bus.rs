//! `EventBus`: the one object a service builds at startup and passes around.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consumer::{EventHandler, EventRegistry, Subscriber};
use crate::envelope::{DomainEvent, Payload};
use crate::publisher::{Outbox, Publisher};
use crate::topology::TopologyDeclarator;
use crate::transport::{self, Transport};
use crate::utils::error::BusError;

/// Connection manager, publisher and subscriber for one service, sharing a
/// single broker link.
pub struct EventBus {
    settings: Settings,
    connection: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    relay_stop: watch::Sender<bool>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Build a bus over an explicit transport. Nothing connects yet.
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self, BusError> {
        let topology = Arc::new(TopologyDeclarator::from_settings(&settings));
        let connection = ConnectionManager::new(
            transport,
            &settings.broker.url,
            Duration::from_millis(settings.broker.connect_timeout_ms),
            settings.reconnect.clone(),
            topology,
        );

        let mut publisher = Publisher::new(
            connection.clone(),
            &settings.broker.exchange,
            &settings.service.name,
            Duration::from_millis(settings.publisher.publish_timeout_ms),
        );
        if settings.outbox.enabled {
            publisher = publisher.with_outbox(Outbox::open(&settings.outbox.path)?);
        }

        let subscriber = Subscriber::new(
            &settings.service.name,
            connection.clone(),
            settings.consumer.clone(),
        );
        let (relay_stop, _) = watch::channel(false);

        Ok(Self {
            settings,
            connection,
            publisher: Arc::new(publisher),
            subscriber,
            relay_stop,
            relay: Mutex::new(None),
        })
    }

    /// Build a bus whose transport is picked from `broker.url`.
    pub fn from_settings(settings: Settings) -> Result<Self, BusError> {
        let transport = transport::from_url(&settings.broker.url, settings.publisher.confirms)?;
        Self::new(settings, transport)
    }

    pub fn service(&self) -> &str {
        &self.settings.service.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Connect, and start the outbox relay when the outbox is enabled.
    /// Only fatal errors are returned; an unreachable broker is retried in
    /// the background.
    pub async fn connect(&self) -> Result<(), BusError> {
        self.connection.connect().await?;

        let mut relay = self.relay.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if relay.is_none() && self.publisher.outbox().is_some() {
            let interval = Duration::from_millis(self.settings.outbox.relay_interval_ms);
            *relay = Some(tokio::spawn(
                self.publisher
                    .clone()
                    .run_relay(interval, self.relay_stop.subscribe()),
            ));
        }
        Ok(())
    }

    /// Subscribe every handler in `registry`, then connect.
    pub async fn start(&self, registry: EventRegistry) -> Result<(), BusError> {
        if registry.service() != self.service() {
            return Err(BusError::ServiceMismatch {
                expected: self.service().to_string(),
                found: registry.service().to_string(),
            });
        }
        let handlers = registry.len();
        for registration in registry.into_registrations() {
            self.subscriber.add(registration).await?;
        }
        self.connect().await?;
        info!(service = self.service(), handlers, "event bus started");
        Ok(())
    }

    pub async fn publish(&self, event_name: &str, data: Payload) -> bool {
        self.publisher.publish(event_name, data).await
    }

    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> bool {
        self.publisher.publish_event(event).await
    }

    pub async fn publish_reliable(&self, event_name: &str, data: Payload) -> Result<String, BusError> {
        self.publisher.publish_reliable(event_name, data).await
    }

    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        self.subscriber.subscribe(pattern, handler).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connection state as a watch, for readiness probes.
    pub fn readiness(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn subscriber(&self) -> Arc<Subscriber> {
        self.subscriber.clone()
    }

    /// Stop consumers, then the outbox relay, then close the channel and the
    /// connection.
    pub async fn shutdown(&self) {
        let grace = Duration::from_millis(self.settings.consumer.shutdown_grace_ms);
        self.subscriber.stop(grace).await;

        self.relay_stop.send_replace(true);
        let relay = self
            .relay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = relay {
            let _ = handle.await;
        }

        self.connection.disconnect().await;
        info!(service = self.service(), "event bus shut down");
    }
}
