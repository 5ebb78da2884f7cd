//! Event handler contract

use crate::event::DomainEvent;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Event handler trait
///
/// Handlers are subscribed to an event type on the [`EventBus`](crate::EventBus)
/// and invoked by its workers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the event
    async fn handle(&self, event: &DomainEvent) -> Result<(), EventHandlerError>;

    /// Whether this handler accepts events of `event_type`
    fn can_handle(&self, _event_type: &str) -> bool {
        true
    }

    /// Handler name, used in logs and dead letters
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Event handler error
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventHandlerError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event processing error: {0}")]
    ProcessingError(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Boxed future returned by closure handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), EventHandlerError>> + Send>>;

/// Event handler backed by an async closure.
pub struct FnHandler {
    name: String,
    event_types: Option<Vec<String>>,
    func: Arc<dyn Fn(DomainEvent) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    /// Restrict the handler to the given event types
    pub fn only(mut self, event_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    /// Convert into a shareable handler reference
    pub fn into_handler(self) -> Arc<dyn EventHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<(), EventHandlerError> {
        (self.func)(event.clone()).await
    }

    fn can_handle(&self, event_type: &str) -> bool {
        match &self.event_types {
            Some(types) => types.iter().any(|t| t == event_type),
            None => true,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a handler from an async closure.
///
/// # Examples
///
/// ```rust,ignore
/// let handler = handler_fn("audit", |event| async move {
///     println!("{} v{}", event.event_type, event.version);
///     Ok(())
/// });
/// bus.subscribe("order.created", handler.into_handler());
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> FnHandler
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EventHandlerError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        event_types: None,
        func: Arc::new(move |event: DomainEvent| -> HandlerFuture { Box::pin(func(event)) }),
    }
}
