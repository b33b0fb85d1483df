use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{DomainEvent, EventEnvelope};

/// How a handler failed, which decides what happens to the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth another try; redelivered up to the configured limit.
    #[error("{0}")]
    Retryable(String),

    /// Will never succeed; dead-lettered right away.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(reason: impl std::fmt::Display) -> Self {
        HandlerError::Retryable(reason.to_string())
    }

    pub fn permanent(reason: impl std::fmt::Display) -> Self {
        HandlerError::Permanent(reason.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

pub type HandlerResult = Result<(), HandlerError>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> HandlerResult;

    /// Distinguishes several handlers bound to the same pattern in one
    /// service. Named handlers get their own queue.
    fn name(&self) -> Option<&str> {
        None
    }
}

pub struct FnHandler<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: &EventEnvelope) -> HandlerResult {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _future: PhantomData,
    })
}

/// Handler for one `DomainEvent` type. A payload that does not decode is a
/// permanent failure.
pub fn typed_handler<E, F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    E: DomainEvent + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |event: EventEnvelope| {
        let f = f.clone();
        async move {
            let payload: E = event
                .decode()
                .map_err(|e| HandlerError::permanent(format!("invalid {} payload: {e}", E::NAME)))?;
            f(payload).await
        }
    })
}

struct Named {
    name: String,
    inner: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for Named {
    async fn handle(&self, event: &EventEnvelope) -> HandlerResult {
        self.inner.handle(event).await
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Give `handler` a name so it gets a queue of its own.
pub fn named(name: &str, handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
    Arc::new(Named {
        name: name.to_string(),
        inner: handler,
    })
}
