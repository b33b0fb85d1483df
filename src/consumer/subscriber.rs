use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{EventHandler, HandlerError, HandlerResult};
use super::registry::Registration;
use crate::config::ConsumerSettings;
use crate::connection::{ConnectionManager, Link, LinkListener, until_stopped};
use crate::envelope::EventEnvelope;
use crate::topology::SubscriptionTopology;
use crate::transport::{
    Delivery, DeliveryStream, HeaderValue, JSON_CONTENT_TYPE, OutgoingMessage, RETRY_COUNT_HEADER,
};
use crate::utils::error::BusError;

struct ActiveLoop {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Subscription {
    registration: Registration,
    topology: SubscriptionTopology,
    consumer_tag: String,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
}

impl Subscription {
    fn queue(&self) -> &str {
        &self.topology.queue.name
    }
}

enum Outcome {
    Ack,
    Requeue,
    DeadLetter,
}

/// Runs one consumption loop per subscribed queue and re-establishes every
/// loop after a reconnect.
pub struct Subscriber {
    me: Weak<Subscriber>,
    service: String,
    connection: Arc<ConnectionManager>,
    settings: ConsumerSettings,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    workers: Arc<Semaphore>,
    stop: watch::Sender<bool>,
}

impl Subscriber {
    /// Build a subscriber and register it for reconnect notifications.
    pub fn new(service: &str, connection: Arc<ConnectionManager>, settings: ConsumerSettings) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
        let subscriber = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            service: service.to_string(),
            connection: connection.clone(),
            settings,
            subscriptions: Mutex::new(Vec::new()),
            workers,
            stop,
        });

        let listener: Arc<dyn LinkListener> = subscriber.clone();
        connection.add_listener(&listener);
        subscriber
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Queue names of every recorded subscription.
    pub fn queues(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|subscription| subscription.queue().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Subscribe `handler` to every event matching `pattern`.
    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let registration = Registration::new(&self.service, pattern, handler)?;
        self.add(registration).await
    }

    /// Record the subscription so reconnects restore it, then set it up now
    /// if a link is live. Transient setup failures are left to the next
    /// reconnect; fatal ones are returned and the subscription dropped.
    pub async fn add(&self, registration: Registration) -> Result<(), BusError> {
        if self.stopping() {
            return Err(BusError::ShuttingDown);
        }

        let subscription = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if subscriptions
                .iter()
                .any(|existing| existing.queue() == registration.queue)
            {
                return Err(BusError::DuplicateSubscription(registration.queue));
            }

            let topology = self
                .connection
                .topology()
                .subscription(&registration.queue, &registration.pattern);
            let subscription = Arc::new(Subscription {
                consumer_tag: format!("{}.{}", registration.queue, uuid::Uuid::new_v4().simple()),
                registration,
                topology,
                active: tokio::sync::Mutex::new(None),
            });
            subscriptions.push(subscription.clone());
            subscription
        };

        info!(
            queue = subscription.queue(),
            pattern = %subscription.registration.pattern,
            "subscription registered"
        );

        if let Some(link) = self.connection.current() {
            if let Err(e) = self.activate(&subscription, &link).await {
                if e.is_fatal() {
                    self.subscriptions
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .retain(|existing| !Arc::ptr_eq(existing, &subscription));
                    return Err(e);
                }
                warn!(
                    queue = subscription.queue(),
                    error = %e,
                    "subscription setup failed, retrying after reconnect"
                );
            }
        }
        Ok(())
    }

    /// Declare the queue and start its loop on `link`, unless a loop for this
    /// link generation is already running.
    async fn activate(&self, subscription: &Arc<Subscription>, link: &Arc<Link>) -> Result<(), BusError> {
        let Some(this) = self.me.upgrade() else {
            return Err(BusError::ShuttingDown);
        };

        let mut active = subscription.active.lock().await;
        if let Some(running) = active.as_ref() {
            if running.generation >= link.generation && !running.handle.is_finished() {
                return Ok(());
            }
        }

        self.connection
            .topology()
            .declare_subscription(link.channel.as_ref(), &subscription.topology)
            .await?;
        let deliveries = link
            .channel
            .consume(
                subscription.queue(),
                &subscription.consumer_tag,
                self.settings.prefetch,
            )
            .await?;

        let handle = tokio::spawn(this.consume(subscription.clone(), link.clone(), deliveries));
        *active = Some(ActiveLoop {
            generation: link.generation,
            handle,
        });
        debug!(
            queue = subscription.queue(),
            generation = link.generation,
            "consumer started"
        );
        Ok(())
    }

    async fn consume(self: Arc<Self>, subscription: Arc<Subscription>, link: Arc<Link>, mut deliveries: DeliveryStream) {
        let mut stop = self.stop.subscribe();
        loop {
            let next = tokio::select! {
                biased;
                _ = until_stopped(&mut stop) => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(&subscription, &link, delivery).await,
                Some(Err(e)) => {
                    warn!(queue = subscription.queue(), error = %e, "delivery stream failed");
                    break;
                }
                None => break,
            }
        }
        debug!(queue = subscription.queue(), generation = link.generation, "consumer stopped");

        // A loop only ends on its own when the channel or the broker consumer
        // is gone; the link has to be rebuilt to resume consuming.
        if !self.stopping() {
            self.connection
                .report_lost(&link, "consumer stream ended")
                .await;
        }
    }

    async fn process(&self, subscription: &Subscription, link: &Link, delivery: Delivery) {
        let queue = subscription.queue();
        let Ok(_permit) = self.workers.clone().acquire_owned().await else {
            self.settle(queue, &delivery, Outcome::Requeue).await;
            return;
        };

        let envelope = match EventEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    queue,
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "undecodable message dead-lettered"
                );
                self.settle(queue, &delivery, Outcome::DeadLetter).await;
                return;
            }
        };

        match self.run_handler(subscription.registration.handler.clone(), &envelope).await {
            Ok(()) => {
                debug!(
                    queue,
                    event = envelope.event_name(),
                    message_id = envelope.message_id(),
                    "event handled"
                );
                self.settle(queue, &delivery, Outcome::Ack).await;
            }
            Err(e) => self.handle_failure(queue, link, &delivery, &envelope, e).await,
        }
    }

    /// Run the handler in its own task so a panic or a timeout counts as a
    /// retryable failure instead of taking the loop down.
    async fn run_handler(&self, handler: Arc<dyn EventHandler>, envelope: &EventEnvelope) -> HandlerResult {
        let timeout = Duration::from_millis(self.settings.handler_timeout_ms);
        let event = envelope.clone();
        let task = tokio::spawn(async move { tokio::time::timeout(timeout, handler.handle(&event)).await });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandlerError::retryable(format!(
                "handler timed out after {}ms",
                timeout.as_millis()
            ))),
            Err(e) if e.is_panic() => Err(HandlerError::retryable("handler panicked")),
            Err(e) => Err(HandlerError::retryable(e)),
        }
    }

    async fn handle_failure(
        &self,
        queue: &str,
        link: &Link,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        error: HandlerError,
    ) {
        let attempts = delivery.retry_count();
        let event = envelope.event_name();
        let message_id = envelope.message_id();

        if !error.is_retryable() || attempts >= self.settings.max_redeliveries {
            error!(
                queue,
                event,
                message_id,
                attempts,
                error = %error,
                "handler failed, message dead-lettered"
            );
            self.settle(queue, delivery, Outcome::DeadLetter).await;
            return;
        }

        warn!(
            queue,
            event,
            message_id,
            attempt = attempts + 1,
            error = %error,
            "handler failed, message re-enqueued"
        );

        let mut retry = OutgoingMessage {
            body: delivery.body.clone(),
            headers: delivery.headers.clone(),
            persistent: true,
            message_id: delivery.message_id.clone(),
            content_type: JSON_CONTENT_TYPE.to_string(),
        };
        retry.headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(attempts) + 1),
        );

        let timeout = Duration::from_millis(self.settings.ack_timeout_ms);
        match tokio::time::timeout(timeout, link.channel.publish("", queue, retry)).await {
            Ok(Ok(())) => self.settle(queue, delivery, Outcome::Ack).await,
            Ok(Err(e)) => {
                warn!(queue, error = %e, "re-enqueue failed, requeueing original");
                self.settle(queue, delivery, Outcome::Requeue).await;
            }
            Err(_) => {
                warn!(queue, "re-enqueue timed out, requeueing original");
                self.settle(queue, delivery, Outcome::Requeue).await;
            }
        }
    }

    /// Ack or reject on the delivery's own channel. A failure here means the
    /// channel is gone and the broker will redeliver.
    async fn settle(&self, queue: &str, delivery: &Delivery, outcome: Outcome) {
        let timeout = Duration::from_millis(self.settings.ack_timeout_ms);
        let result = match outcome {
            Outcome::Ack => tokio::time::timeout(timeout, delivery.ack()).await,
            Outcome::Requeue => tokio::time::timeout(timeout, delivery.reject(true)).await,
            Outcome::DeadLetter => tokio::time::timeout(timeout, delivery.reject(false)).await,
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue, delivery_tag = delivery.delivery_tag, error = %e, "could not settle delivery"),
            Err(_) => warn!(queue, delivery_tag = delivery.delivery_tag, "settling delivery timed out"),
        }
    }

    /// Stop pulling deliveries, cancel the broker consumers and give in-flight
    /// handlers up to `grace` to finish.
    pub async fn stop(&self, grace: Duration) {
        self.stop.send_replace(true);
        let subscriptions = self.snapshot();

        if let Some(channel) = self.connection.channel() {
            for subscription in &subscriptions {
                if let Err(e) = channel.cancel(&subscription.consumer_tag).await {
                    debug!(queue = subscription.queue(), error = %e, "cancel failed");
                }
            }
        }

        let mut handles = Vec::new();
        for subscription in &subscriptions {
            if let Some(active) = subscription.active.lock().await.take() {
                handles.push(active.handle);
            }
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "in-flight handlers still running after grace period, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!(service = %self.service, "subscriber stopped");
    }
}

#[async_trait]
impl LinkListener for Subscriber {
    async fn on_connected(&self, link: Arc<Link>) -> Result<(), BusError> {
        if self.stopping() {
            return Ok(());
        }
        for subscription in self.snapshot() {
            self.activate(&subscription, &link).await?;
        }
        Ok(())
    }
}
