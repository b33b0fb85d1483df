use std::sync::Arc;

use super::handler::EventHandler;
use crate::topology::{RoutingPattern, queue_name};
use crate::utils::error::BusError;

/// One handler bound to one pattern, with the queue it consumes from.
#[derive(Clone)]
pub struct Registration {
    pub pattern: RoutingPattern,
    pub queue: String,
    pub handler: Arc<dyn EventHandler>,
}

impl Registration {
    pub fn new(service: &str, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<Self, BusError> {
        let pattern = RoutingPattern::parse(pattern)?;
        let queue = queue_name(service, &pattern, handler.name());
        Ok(Self {
            pattern,
            queue,
            handler,
        })
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("pattern", &self.pattern.as_str())
            .field("queue", &self.queue)
            .finish()
    }
}

/// The handlers a service runs, declared once at startup and handed to
/// `EventBus::start`.
///
/// ```ignore
/// let registry = EventRegistry::new("notifications")
///     .on("booking.*", booking_handler)?
///     .on("payment.#", payment_handler)?;
/// ```
#[derive(Debug, Clone)]
pub struct EventRegistry {
    service: String,
    registrations: Vec<Registration>,
}

impl EventRegistry {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            registrations: Vec::new(),
        }
    }

    pub fn on(mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<Self, BusError> {
        self.register(pattern, handler)?;
        Ok(self)
    }

    /// Fails on a malformed pattern, or when the handler would share a queue
    /// with one already registered. Name the second handler for a pattern to
    /// give it its own queue.
    pub fn register(&mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<&Registration, BusError> {
        let registration = Registration::new(&self.service, pattern, handler)?;
        if self.registrations.iter().any(|r| r.queue == registration.queue) {
            return Err(BusError::DuplicateSubscription(registration.queue));
        }
        self.registrations.push(registration);
        Ok(&self.registrations[self.registrations.len() - 1])
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}
