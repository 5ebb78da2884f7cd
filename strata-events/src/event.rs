//! Domain event envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event priority.
///
/// Informational only: the bus never reorders events by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Lowest priority
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority
    High,
    /// Critical priority
    Critical,
}

/// Domain event
///
/// An immutable fact about one aggregate instance. The `version` is assigned by
/// the event store when the event is appended to its aggregate's stream; until
/// then it is `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event ID
    pub id: Uuid,

    /// Event type tag (e.g. `order.created`)
    pub event_type: String,

    /// Aggregate ID
    pub aggregate_id: String,

    /// Aggregate type
    pub aggregate_type: String,

    /// Position in the aggregate's stream, starting at 1
    pub version: u64,

    /// Timestamp when the event was created
    pub timestamp: DateTime<Utc>,

    /// Event payload
    pub payload: serde_json::Value,

    /// Custom metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Priority tag
    #[serde(default)]
    pub priority: EventPriority,

    /// Optional correlation ID for tracing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Optional causation ID (ID of the event that caused this event)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
}

impl DomainEvent {
    /// Create a new domain event
    ///
    /// The aggregate ID and type are left empty; they are stamped when the
    /// event is raised on an aggregate.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: String::new(),
            aggregate_type: String::new(),
            version: 0,
            timestamp: Utc::now(),
            payload,
            metadata: serde_json::Map::new(),
            priority: EventPriority::default(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Create a new domain event already bound to an aggregate
    pub fn for_aggregate(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(event_type, payload);
        event.aggregate_id = aggregate_id.into();
        event.aggregate_type = aggregate_type.into();
        event
    }

    /// Set a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set causation ID
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Mark this event as caused by `cause`, inheriting its correlation ID
    pub fn caused_by(mut self, cause: &DomainEvent) -> Self {
        self.causation_id = Some(cause.id);
        self.correlation_id = cause.correlation_id.or(Some(cause.id));
        self
    }

    /// Read a metadata entry
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}
