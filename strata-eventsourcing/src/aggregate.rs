//! Aggregate root for event sourcing

use crate::store::EventStoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use strata_events::{DomainEvent, EventBusError};

/// Aggregate trait
///
/// Aggregates are the core building blocks of event sourcing. Domain
/// operations raise events; `apply_event` is the only place state changes.
pub trait Aggregate: Debug + Send + Sync + Sized + 'static {
    /// Get aggregate type name
    fn aggregate_type() -> &'static str;

    /// Create a new instance (default state)
    fn new_instance(id: String) -> Self;

    /// Version and pending-event bookkeeping
    fn root(&self) -> &AggregateRoot;

    /// Mutable version and pending-event bookkeeping
    fn root_mut(&mut self) -> &mut AggregateRoot;

    /// Apply an event to the aggregate state
    fn apply_event(&mut self, event: &DomainEvent) -> Result<(), AggregateError>;

    /// Serialize the state for a snapshot
    fn snapshot_state(&self) -> Result<serde_json::Value, AggregateError> {
        Err(AggregateError::SnapshotsUnsupported(
            Self::aggregate_type().to_string(),
        ))
    }

    /// Restore the state from a snapshot
    fn restore_state(&mut self, _state: serde_json::Value) -> Result<(), AggregateError> {
        Err(AggregateError::SnapshotsUnsupported(
            Self::aggregate_type().to_string(),
        ))
    }

    /// Get aggregate ID
    fn aggregate_id(&self) -> &str {
        &self.root().id
    }

    /// Number of committed events applied to this instance
    fn version(&self) -> u64 {
        self.root().version
    }

    /// Record a new event
    ///
    /// Stamps the aggregate ID and type onto the event, applies it, and keeps
    /// it pending until the aggregate is saved. The version is unchanged.
    fn raise_event(&mut self, mut event: DomainEvent) -> Result<(), AggregateError> {
        event.aggregate_id = self.aggregate_id().to_string();
        event.aggregate_type = Self::aggregate_type().to_string();
        self.apply_event(&event)?;
        self.root_mut().add_event(event);
        Ok(())
    }

    /// Get uncommitted events
    fn uncommitted_events(&self) -> &[DomainEvent] {
        self.root().uncommitted_events()
    }

    /// Mark pending events as committed and advance the version past them
    fn mark_events_committed(&mut self) {
        self.root_mut().commit();
    }

    /// Replay stored events in order
    fn load_from_history(&mut self, events: &[DomainEvent]) -> Result<(), AggregateError> {
        for event in events {
            self.apply_event(event)?;
            self.root_mut().version = event.version;
        }
        Ok(())
    }
}

/// Bookkeeping shared by every aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateRoot {
    /// Aggregate ID
    pub id: String,

    /// Current version
    pub version: u64,

    /// Uncommitted events
    #[serde(skip)]
    uncommitted_events: Vec<DomainEvent>,
}

impl AggregateRoot {
    /// Create new aggregate root
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            uncommitted_events: Vec::new(),
        }
    }

    /// Add uncommitted event
    pub fn add_event(&mut self, event: DomainEvent) {
        self.uncommitted_events.push(event);
    }

    /// Get uncommitted events
    pub fn uncommitted_events(&self) -> &[DomainEvent] {
        &self.uncommitted_events
    }

    /// Clear uncommitted events and advance the version by their count
    pub fn commit(&mut self) {
        self.version += self.uncommitted_events.len() as u64;
        self.uncommitted_events.clear();
    }
}

/// Aggregate error
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Aggregate not found: {0}")]
    NotFound(String),

    #[error("Event application failed: {0}")]
    EventApplicationFailed(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Snapshots are not supported by aggregate type {0}")]
    SnapshotsUnsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Publish(#[from] EventBusError),
}

impl AggregateError {
    /// Whether this error is an optimistic concurrency conflict
    ///
    /// Conflicts are resolved by reloading the aggregate and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            AggregateError::Store(EventStoreError::ConcurrencyConflict { .. })
        )
    }
}

impl From<serde_json::Error> for AggregateError {
    fn from(err: serde_json::Error) -> Self {
        AggregateError::Serialization(err.to_string())
    }
}

/// Aggregate snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate ID
    pub aggregate_id: String,

    /// Aggregate type
    pub aggregate_type: String,

    /// Version at snapshot
    pub version: u64,

    /// Snapshot timestamp
    pub timestamp: DateTime<Utc>,

    /// Serialized state
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Create new snapshot
    pub fn new(
        aggregate_id: String,
        aggregate_type: String,
        version: u64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type,
            version,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Capture an aggregate's current state
    pub fn of<A: Aggregate>(aggregate: &A) -> Result<Self, AggregateError> {
        Ok(Self::new(
            aggregate.aggregate_id().to_string(),
            A::aggregate_type().to_string(),
            aggregate.version(),
            aggregate.snapshot_state()?,
        ))
    }
}
