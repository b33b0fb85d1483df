//! Skip deliveries whose `messageId` was already handled successfully.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::handler::{EventHandler, HandlerResult};
use crate::envelope::EventEnvelope;

/// Time-bounded set of message ids.
#[derive(Debug)]
pub struct SeenMessages {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl SeenMessages {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.get(message_id)
            .is_some_and(|at| at.elapsed() < self.window)
    }

    pub fn record(&self, message_id: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = self.window;
        seen.retain(|_, at| at.elapsed() < window);
        seen.insert(message_id.to_string(), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps a handler so a redelivered message it already processed is acked
/// without running it again. Envelopes without a `messageId` always run.
pub struct Idempotent {
    inner: Arc<dyn EventHandler>,
    seen: SeenMessages,
}

impl Idempotent {
    pub fn new(inner: Arc<dyn EventHandler>, window: Duration) -> Self {
        Self {
            inner,
            seen: SeenMessages::new(window),
        }
    }
}

#[async_trait]
impl EventHandler for Idempotent {
    async fn handle(&self, event: &EventEnvelope) -> HandlerResult {
        if let Some(id) = event.message_id() {
            if self.seen.contains(id) {
                debug!(event = event.event_name(), message_id = id, "duplicate skipped");
                return Ok(());
            }
        }

        self.inner.handle(event).await?;

        if let Some(id) = event.message_id() {
            self.seen.record(id);
        }
        Ok(())
    }

    fn name(&self) -> Option<&str> {
        self.inner.name()
    }
}

pub fn idempotent(handler: Arc<dyn EventHandler>, window: Duration) -> Arc<dyn EventHandler> {
    Arc::new(Idempotent::new(handler, window))
}
