//! Projections for read models

use async_trait::async_trait;
use std::sync::Arc;
use strata_events::{DomainEvent, EventBus, EventHandler, EventHandlerError};
use strata_eventsourcing::{EventStore, EventStoreError};
use thiserror::Error;
use tracing::{debug, info};

/// Projection trait
///
/// Projections build read models from events. They receive live events
/// through a [`ProjectionHandler`] subscribed on the bus, and can be rebuilt
/// from the event store at any time.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Project an event to update the read model
    async fn project(&self, event: &DomainEvent) -> Result<(), ProjectionError>;

    /// Whether this projection consumes events of `event_type`
    fn handles(&self, _event_type: &str) -> bool {
        true
    }

    /// Projection name, used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Discard the read model
    async fn reset(&self) -> Result<(), ProjectionError> {
        Ok(())
    }

    /// Rebuild the projection from scratch
    async fn rebuild(&self, events: &[DomainEvent]) -> Result<(), ProjectionError> {
        self.reset().await?;
        for event in events.iter().filter(|e| self.handles(&e.event_type)) {
            self.project(event).await?;
        }
        Ok(())
    }
}

/// Projection error
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Projection failed: {0}")]
    ProjectionFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Projection manager
///
/// Manages multiple projections and rebuilds.
#[derive(Default)]
pub struct ProjectionManager {
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionManager {
    /// Create new projection manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a projection
    pub fn add_projection(&mut self, projection: Arc<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Registered projections in registration order
    pub fn projections(&self) -> &[Arc<dyn Projection>] {
        &self.projections
    }

    /// Project event to every projection that handles its type
    pub async fn project_event(&self, event: &DomainEvent) -> Result<(), ProjectionError> {
        for projection in self.projections.iter().filter(|p| p.handles(&event.event_type)) {
            projection.project(event).await?;
        }
        Ok(())
    }

    /// Subscribe every projection to the event types it handles
    pub fn subscribe_all<'a>(&self, bus: &EventBus, event_types: impl IntoIterator<Item = &'a str>) {
        for event_type in event_types {
            for projection in self.projections.iter().filter(|p| p.handles(event_type)) {
                bus.subscribe(event_type, ProjectionHandler::shared(projection.clone()));
            }
        }
    }

    /// Reset every projection and replay the whole store through it
    pub async fn rebuild_all(&self, store: &dyn EventStore) -> Result<(), ProjectionError> {
        let events = store.get_all_events(None).await?;
        for projection in &self.projections {
            projection.rebuild(&events).await?;
            debug!(projection = projection.name(), "Projection rebuilt");
        }
        info!(
            projections = self.projections.len(),
            events = events.len(),
            "Rebuilt projections"
        );
        Ok(())
    }
}

/// Event handler wrapper for projections
pub struct ProjectionHandler<P: Projection + ?Sized> {
    projection: Arc<P>,
}

impl<P: Projection + ?Sized + 'static> ProjectionHandler<P> {
    /// Wrap a projection for subscription on an event bus
    pub fn new(projection: Arc<P>) -> Self {
        Self { projection }
    }

    /// Wrap a projection as a handler ready to subscribe
    pub fn shared(projection: Arc<P>) -> Arc<dyn EventHandler> {
        Arc::new(Self::new(projection))
    }
}

impl<P: Projection + ?Sized> Clone for ProjectionHandler<P> {
    fn clone(&self) -> Self {
        Self {
            projection: self.projection.clone(),
        }
    }
}

#[async_trait]
impl<P: Projection + ?Sized> EventHandler for ProjectionHandler<P> {
    async fn handle(&self, event: &DomainEvent) -> Result<(), EventHandlerError> {
        self.projection
            .project(event)
            .await
            .map_err(|e| EventHandlerError::ProcessingError(e.to_string()))
    }

    fn can_handle(&self, event_type: &str) -> bool {
        self.projection.handles(event_type)
    }

    fn name(&self) -> &str {
        self.projection.name()
    }
}
