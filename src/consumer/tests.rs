use super::*;
use crate::config::{ConsumerSettings, Settings};
use crate::connection::ConnectionManager;
use crate::envelope::schema::{BookingCancelled, PaymentSucceeded};
use crate::envelope::{DomainEvent, EventEnvelope, Payload};
use crate::publisher::Publisher;
use crate::tests::eventually;
use crate::topology::TopologyDeclarator;
use crate::transport::memory::InMemoryBroker;
use crate::transport::{OutgoingMessage, RETRY_COUNT_HEADER};
use crate::utils::error::BusError;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Calls = Arc<Mutex<Vec<EventEnvelope>>>;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        handler_timeout_ms: 500,
        ack_timeout_ms: 500,
        ..Settings::default().consumer
    }
}

struct Harness {
    broker: InMemoryBroker,
    manager: Arc<ConnectionManager>,
    subscriber: Arc<Subscriber>,
    publisher: Publisher,
}

impl Harness {
    fn new(settings: ConsumerSettings) -> Self {
        let broker = InMemoryBroker::new();
        let mut reconnect = Settings::default().reconnect;
        reconnect.initial_delay_ms = 10;
        reconnect.jitter = 0.0;
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            "memory://",
            Duration::from_secs(1),
            reconnect,
            Arc::new(TopologyDeclarator::new("domain_events", true, None)),
        );
        let subscriber = Subscriber::new("inventory", manager.clone(), settings);
        let publisher = Publisher::new(manager.clone(), "domain_events", "bookings", Duration::from_secs(1));
        Self {
            broker,
            manager,
            subscriber,
            publisher,
        }
    }

    async fn connected(settings: ConsumerSettings) -> Self {
        let harness = Self::new(settings);
        harness.manager.connect().await.unwrap();
        harness
    }

    async fn shutdown(self) {
        self.subscriber.stop(Duration::from_secs(1)).await;
        self.manager.disconnect().await;
    }
}

fn recorder<F>(calls: &Calls, outcome: F) -> Arc<dyn EventHandler>
where
    F: Fn(&EventEnvelope, usize) -> HandlerResult + Send + Sync + 'static,
{
    let calls = calls.clone();
    let outcome = Arc::new(outcome);
    handler_fn(move |event: EventEnvelope| {
        let calls = calls.clone();
        let outcome = outcome.clone();
        async move {
            let seen = {
                let mut calls = calls.lock().unwrap();
                calls.push(event.clone());
                calls.len()
            };
            outcome(&event, seen)
        }
    })
}

fn count(calls: &Calls) -> usize {
    calls.lock().unwrap().len()
}

fn noop() -> Arc<dyn EventHandler> {
    handler_fn(|_| async { Ok(()) })
}

#[test]
fn test_registry_derives_queue_names_and_rejects_duplicates() {
    let registry = EventRegistry::new("notifications")
        .on("booking.*", noop())
        .unwrap()
        .on("booking.*", named("sms", noop()))
        .unwrap();

    let queues: Vec<&str> = registry.registrations().iter().map(|r| r.queue.as_str()).collect();
    assert_eq!(queues, vec!["notifications-booking.*", "notifications-booking.*-sms"]);
    assert_eq!(registry.service(), "notifications");
    assert_eq!(registry.len(), 2);

    let err = registry.clone().on("booking.*", noop()).unwrap_err();
    assert!(matches!(err, BusError::DuplicateSubscription(q) if q == "notifications-booking.*"));

    let err = EventRegistry::new("svc").on("booking..x", noop()).unwrap_err();
    assert!(matches!(err, BusError::InvalidPattern { .. }));
}

#[test]
fn test_handler_error_kinds() {
    assert!(HandlerError::retryable("db down").is_retryable());
    assert!(!HandlerError::permanent("bad payload").is_retryable());
    assert_eq!(HandlerError::permanent("x").to_string(), "permanent failure: x");
}

#[tokio::test]
async fn test_idempotent_skips_already_handled_ids() {
    let calls: Calls = Arc::default();
    let handler = idempotent(recorder(&calls, |_, _| Ok(())), Duration::from_secs(60));
    let event = EventEnvelope::new("user.created", payload(json!({})), "users", chrono::Utc::now()).unwrap();

    handler.handle(&event).await.unwrap();
    handler.handle(&event).await.unwrap();
    assert_eq!(count(&calls), 1);

    let other = EventEnvelope::new("user.created", payload(json!({})), "users", chrono::Utc::now()).unwrap();
    handler.handle(&other).await.unwrap();
    assert_eq!(count(&calls), 2);
}

#[tokio::test]
async fn test_idempotent_does_not_remember_failures() {
    let calls: Calls = Arc::default();
    let handler = idempotent(
        recorder(&calls, |_, seen| match seen {
            1 => Err(HandlerError::retryable("flaky")),
            _ => Ok(()),
        }),
        Duration::from_secs(60),
    );
    let event = EventEnvelope::new("user.created", payload(json!({})), "users", chrono::Utc::now()).unwrap();

    assert!(handler.handle(&event).await.is_err());
    assert!(handler.handle(&event).await.is_ok());
    assert!(handler.handle(&event).await.is_ok());
    assert_eq!(count(&calls), 2);
}

#[test]
fn test_seen_messages_expire() {
    let seen = dedup::SeenMessages::new(Duration::from_millis(20));
    seen.record("a");
    assert!(seen.contains("a"));
    std::thread::sleep(Duration::from_millis(40));
    assert!(!seen.contains("a"));
    seen.record("b");
    assert_eq!(seen.len(), 1);
}

#[tokio::test]
async fn test_typed_handler_decodes_or_fails_permanently() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = typed_handler(move |event: PaymentSucceeded| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.payment_id);
            Ok(())
        }
    });

    let good = EventEnvelope::new(
        PaymentSucceeded::NAME,
        payload(json!({ "paymentId": "P1", "reservationId": "R1", "amount": 10.0, "currency": "EUR" })),
        "payments",
        chrono::Utc::now(),
    )
    .unwrap();
    handler.handle(&good).await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec!["P1".to_string()]);

    let bad = EventEnvelope::new(PaymentSucceeded::NAME, payload(json!({ "amount": "ten" })), "payments", chrono::Utc::now())
        .unwrap();
    assert!(matches!(handler.handle(&bad).await, Err(HandlerError::Permanent(_))));
}

#[tokio::test]
async fn test_subscription_recorded_before_connect_starts_on_connect() {
    let harness = Harness::new(consumer_settings());
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe("booking.*", recorder(&calls, |_, _| Ok(())))
        .await
        .unwrap();
    assert!(harness.broker.queue_names().is_empty());

    harness.manager.connect().await.unwrap();
    assert_eq!(
        harness.broker.queue_names(),
        vec!["inventory-booking.*".to_string(), "inventory-booking.*.dead".to_string()]
    );

    assert!(harness.publisher.publish("booking.created", payload(json!({ "id": 1 }))).await);
    eventually("event handled", || count(&calls) == 1).await;
    assert_eq!(calls.lock().unwrap()[0].data()["id"], 1);
    eventually("acked", || harness.broker.unacked_count("inventory-booking.*") == 0).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_handler_is_redelivered_with_same_payload() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe(
            "payment.succeeded",
            recorder(&calls, |_, seen| match seen {
                1 => Err(HandlerError::retryable("ledger unavailable")),
                _ => Ok(()),
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("payment.succeeded", payload(json!({ "paymentId": "P1" }))).await);
    eventually("handled twice", || count(&calls) == 2).await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls[0].message_id(), calls[1].message_id());
    assert_eq!(calls[0].data(), calls[1].data());
    eventually("queue drained", || {
        harness.broker.queue_depth("inventory-payment.succeeded") == Some(0)
            && harness.broker.unacked_count("inventory-payment.succeeded") == 0
    })
    .await;
    assert_eq!(harness.broker.queue_depth("inventory-payment.succeeded.dead"), Some(0));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered_after_one_retry() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe(
            "booking.*",
            recorder(&calls, |event, _| match event.data().get("poison") {
                Some(_) => Err(HandlerError::retryable("cannot process")),
                None => Ok(()),
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("booking.created", payload(json!({ "poison": true }))).await);
    assert!(harness.publisher.publish("booking.created", payload(json!({ "healthy": true }))).await);

    eventually("poison dead-lettered", || {
        harness.broker.queue_depth("inventory-booking.*.dead") == Some(1)
    })
    .await;
    eventually("healthy handled", || {
        calls.lock().unwrap().iter().any(|e| e.data().contains_key("healthy"))
    })
    .await;

    let poison_attempts = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.data().contains_key("poison"))
        .count();
    assert_eq!(poison_attempts, 2);

    let dead = EventEnvelope::from_bytes(&harness.broker.peek("inventory-booking.*.dead")[0]).unwrap();
    assert_eq!(dead.data()["poison"], true);
    let headers = &harness.broker.peek_headers("inventory-booking.*.dead")[0];
    assert_eq!(headers.get(RETRY_COUNT_HEADER).and_then(|v| v.as_int()), Some(1));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_skips_retry() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe("booking.cancelled", recorder(&calls, |_, _| Err(HandlerError::permanent("unknown reservation"))))
        .await
        .unwrap();

    let event = BookingCancelled {
        reservation_id: "R404".into(),
        reason: None,
    };
    assert!(harness.publisher.publish_event(&event).await);

    eventually("dead-lettered", || {
        harness.broker.queue_depth("inventory-booking.cancelled.dead") == Some(1)
    })
    .await;
    assert_eq!(count(&calls), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let harness = Harness::connected(consumer_settings()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    harness
        .subscriber
        .subscribe(
            "booking.*",
            handler_fn(move |event: EventEnvelope| {
                let counter = counter.clone();
                async move {
                    if event.event_name() == "booking.created" {
                        panic!("handler blew up");
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("booking.created", payload(json!({}))).await);
    assert!(harness.publisher.publish("booking.confirmed", payload(json!({}))).await);

    eventually("healthy event handled", || handled.load(Ordering::SeqCst) == 1).await;
    eventually("panicking event dead-lettered", || {
        harness.broker.queue_depth("inventory-booking.*.dead") == Some(1)
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let settings = ConsumerSettings {
        handler_timeout_ms: 30,
        max_redeliveries: 0,
        ..consumer_settings()
    };
    let harness = Harness::connected(settings).await;
    harness
        .subscriber
        .subscribe(
            "review.created",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("review.created", payload(json!({}))).await);
    eventually("timed-out event dead-lettered", || {
        harness.broker.queue_depth("inventory-review.created.dead") == Some(1)
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_message_is_dead_lettered() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe("booking.*", recorder(&calls, |_, _| Ok(())))
        .await
        .unwrap();

    let channel = harness.manager.channel().unwrap();
    channel
        .publish("domain_events", "booking.created", OutgoingMessage::json(b"{not json".to_vec()))
        .await
        .unwrap();

    eventually("garbage dead-lettered", || {
        harness.broker.queue_depth("inventory-booking.*.dead") == Some(1)
    })
    .await;
    assert_eq!(count(&calls), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_subscription_is_rejected() {
    let harness = Harness::connected(consumer_settings()).await;
    harness.subscriber.subscribe("user.created", noop()).await.unwrap();

    let err = harness.subscriber.subscribe("user.created", noop()).await.unwrap_err();
    assert!(matches!(err, BusError::DuplicateSubscription(_)));
    harness
        .subscriber
        .subscribe("user.created", named("welcome-mail", noop()))
        .await
        .unwrap();
    assert_eq!(
        harness.subscriber.queues(),
        vec!["inventory-user.created".to_string(), "inventory-user.created-welcome-mail".to_string()]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_handler() {
    let harness = Harness::connected(consumer_settings()).await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());
    harness
        .subscriber
        .subscribe(
            "message.sent",
            handler_fn(move |_| {
                let (s, f) = (s.clone(), f.clone());
                async move {
                    s.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    f.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("message.sent", payload(json!({}))).await);
    eventually("handler started", || started.load(Ordering::SeqCst)).await;

    harness.subscriber.stop(Duration::from_secs(2)).await;
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(harness.broker.unacked_count("inventory-message.sent"), 0);
    assert_eq!(harness.broker.consumer_count("inventory-message.sent"), 0);

    let err = harness.subscriber.subscribe("booking.*", noop()).await.unwrap_err();
    assert!(matches!(err, BusError::ShuttingDown));
    harness.manager.disconnect().await;
}

#[tokio::test]
async fn test_stop_gives_up_after_grace_period() {
    let settings = ConsumerSettings {
        handler_timeout_ms: 10_000,
        ..consumer_settings()
    };
    let harness = Harness::connected(settings).await;
    let started = Arc::new(AtomicBool::new(false));
    let s = started.clone();
    harness
        .subscriber
        .subscribe(
            "message.sent",
            handler_fn(move |_| {
                let s = s.clone();
                async move {
                    s.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(harness.publisher.publish("message.sent", payload(json!({}))).await);
    eventually("handler started", || started.load(Ordering::SeqCst)).await;

    let begun = Instant::now();
    harness.subscriber.stop(Duration::from_millis(50)).await;
    assert!(begun.elapsed() < Duration::from_secs(2));

    harness.manager.disconnect().await;
    assert_eq!(harness.broker.queue_depth("inventory-message.sent"), Some(1));
}

#[tokio::test]
async fn test_closed_channel_is_rebuilt_and_consumption_resumes() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe("booking.*", recorder(&calls, |_, _| Ok(())))
        .await
        .unwrap();
    let first = harness.manager.current().unwrap();

    first.channel.close().await.unwrap();

    eventually("link rebuilt", || {
        harness.manager.is_connected()
            && harness
                .manager
                .current()
                .is_some_and(|link| link.generation > first.generation)
    })
    .await;
    eventually("consumer restored", || harness.broker.consumer_count("inventory-booking.*") == 1).await;

    assert!(harness.publisher.publish("booking.created", payload(json!({ "id": 7 }))).await);
    eventually("event handled", || count(&calls) == 1).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_consumer_cancelled_by_broker_is_restored() {
    let harness = Harness::connected(consumer_settings()).await;
    let calls: Calls = Arc::default();
    harness
        .subscriber
        .subscribe("booking.*", recorder(&calls, |_, _| Ok(())))
        .await
        .unwrap();
    let first = harness.manager.current().unwrap().generation;

    harness.broker.cancel_consumers("inventory-booking.*");

    eventually("link rebuilt", || {
        harness
            .manager
            .current()
            .is_some_and(|link| link.generation > first)
    })
    .await;
    eventually("consumer restored", || harness.broker.consumer_count("inventory-booking.*") == 1).await;
    assert_eq!(harness.broker.connection_count(), 1);

    assert!(harness.publisher.publish("booking.updated", payload(json!({ "id": 8 }))).await);
    eventually("event handled", || count(&calls) == 1).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_does_not_trigger_reconnect() {
    let harness = Harness::connected(consumer_settings()).await;
    harness.subscriber.subscribe("booking.*", noop()).await.unwrap();
    let generation = harness.manager.current().unwrap().generation;

    harness.subscriber.stop(Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.manager.is_connected());
    assert_eq!(harness.manager.current().unwrap().generation, generation);
    harness.manager.disconnect().await;
}
