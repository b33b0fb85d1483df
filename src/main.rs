//! CLI for topicbus
//!
//! Subcommands:
//! - `demo`: three services exchanging events over an in-process broker
//! - `publish`: send one event to the configured broker
//! - `listen`: log every event matching a pattern until Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};

use topicbus::config::{Settings, load_config};
use topicbus::connection::ConnectionState;
use topicbus::consumer::{handler_fn, typed_handler};
use topicbus::envelope::schema::{BookingConfirmed, PaymentSucceeded};
use topicbus::transport::memory::InMemoryBroker;
use topicbus::utils::logging;
use topicbus::{BusError, EventBus, EventEnvelope, EventHandler, EventRegistry, HandlerError};

#[derive(Parser)]
#[command(name = "topicbus", about = "Domain event bus over a shared topic exchange")]
enum Command {
    /// Run bookings, payments and notifications against an in-process broker
    Demo,
    /// Publish a single event
    Publish {
        /// Event name, also the routing key (e.g. booking.confirmed)
        #[arg(long)]
        event: String,
        /// JSON object carried as the event payload
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Subscribe to a pattern and log every event until Ctrl-C
    Listen {
        /// Topic pattern; `*` matches one segment, `#` zero or more
        #[arg(long, default_value = "#")]
        pattern: String,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init(&settings.service.log_level);

    let result = match cmd {
        Command::Demo => run_demo(settings).await,
        Command::Publish { event, data } => run_publish(settings, &event, &data).await,
        Command::Listen { pattern } => run_listen(settings, &pattern).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_demo(base: Settings) -> Result<(), BusError> {
    let broker = InMemoryBroker::new();
    let service = |name: &str| {
        let mut settings = base.clone();
        settings.service.name = name.to_string();
        settings.broker.url = "memory://".to_string();
        settings.outbox.enabled = false;
        EventBus::new(settings, Arc::new(broker.clone()))
    };

    let bookings = service("bookings")?;
    let payments = Arc::new(service("payments")?);
    let notifications = service("notifications")?;

    let payments_out = payments.clone();
    let charge = typed_handler(move |booking: BookingConfirmed| {
        let payments = payments_out.clone();
        async move {
            info!(reservation = %booking.reservation_id, total = booking.total, "charging guest");
            let receipt = PaymentSucceeded {
                payment_id: format!("pay-{}", booking.reservation_id),
                reservation_id: booking.reservation_id,
                amount: booking.total,
                currency: "EUR".to_string(),
            };
            match payments.publish_event(&receipt).await {
                true => Ok(()),
                false => Err(HandlerError::retryable("payment event not published")),
            }
        }
    });
    payments
        .start(EventRegistry::new("payments").on("booking.confirmed", charge)?)
        .await?;

    let notify = handler_fn(|event: EventEnvelope| async move {
        info!(event = event.event_name(), source = event.source(), "notifying user");
        Ok(())
    });
    notifications
        .start(EventRegistry::new("notifications").on("#", notify)?)
        .await?;
    bookings.connect().await?;

    let booking = BookingConfirmed {
        reservation_id: "R-1001".to_string(),
        total: 240.0,
    };
    if !bookings.publish_event(&booking).await {
        warn!("booking event was not published");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    info!(queues = ?broker.queue_names(), "demo finished");

    bookings.shutdown().await;
    payments.shutdown().await;
    notifications.shutdown().await;
    Ok(())
}

async fn run_publish(settings: Settings, event: &str, data: &str) -> Result<(), BusError> {
    let payload = match serde_json::from_str::<Value>(data)? {
        Value::Object(map) => map,
        _ => {
            return Err(BusError::Serialization(serde::de::Error::custom(
                "--data must be a JSON object",
            )));
        }
    };

    let timeout = Duration::from_millis(settings.broker.connect_timeout_ms);
    let bus = EventBus::from_settings(settings)?;
    bus.connect().await?;

    let mut readiness = bus.readiness();
    let ready = matches!(
        tokio::time::timeout(
            timeout,
            readiness.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !ready {
        bus.shutdown().await;
        return Err(BusError::NotConnected);
    }

    let published = bus.publish(event, payload).await;
    bus.shutdown().await;
    match published {
        true => {
            info!(event, "event published");
            Ok(())
        }
        false => Err(BusError::NotConnected),
    }
}

fn event_logger() -> Arc<dyn EventHandler> {
    handler_fn(|event: EventEnvelope| async move {
        let data = Value::Object(event.data().clone());
        info!(
            event = event.event_name(),
            source = event.source(),
            message_id = event.message_id(),
            data = %data,
            "event received"
        );
        Ok(())
    })
}

async fn run_listen(settings: Settings, pattern: &str) -> Result<(), BusError> {
    let service = settings.service.name.clone();
    let bus = EventBus::from_settings(settings)?;

    bus.start(EventRegistry::new(&service).on(pattern, event_logger())?)
        .await?;

    info!(pattern, "listening, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown signal received. Exiting gracefully.");
    bus.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_cli_parses_subcommands_and_defaults() {
        let cmd = Command::try_parse_from(["topicbus", "publish", "--event", "booking.confirmed"]).unwrap();
        assert!(matches!(cmd, Command::Publish { ref event, ref data } if event == "booking.confirmed" && data == "{}"));

        let cmd = Command::try_parse_from(["topicbus", "listen"]).unwrap();
        assert!(matches!(cmd, Command::Listen { ref pattern } if pattern == "#"));

        assert!(Command::try_parse_from(["topicbus", "publish"]).is_err());
    }

    #[tokio::test]
    async fn test_event_logger_accepts_any_event() {
        let data = json!({ "reservationId": "R-1", "total": 10.5 })
            .as_object()
            .cloned()
            .unwrap();
        let event = EventEnvelope::new("booking.confirmed", data, "bookings", Utc::now()).unwrap();

        assert!(event_logger().handle(&event).await.is_ok());
    }
}
