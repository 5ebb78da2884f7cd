//! Event Store implementation

use crate::aggregate::Snapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use strata_events::DomainEvent;

/// Concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append at the end of the stream without checking its length
    Any,
    /// The stream must currently hold exactly this many events
    Exact(u64),
}

/// Event store trait
///
/// Implement this trait to provide durable event storage (e.g. an append-only
/// table). [`InMemoryEventStore`] is the volatile default.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate's stream
    ///
    /// Each event receives the next sequential version of the stream and the
    /// stream's aggregate ID. Returns the events as stored.
    async fn append(
        &self,
        aggregate_id: &str,
        events: Vec<DomainEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Load events with a version strictly greater than `from_version`
    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Load events across all streams ordered by timestamp
    async fn get_all_events(
        &self,
        event_type: Option<&str>,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Current length of an aggregate's stream
    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError>;

    /// Save snapshot, replacing any previous one for the aggregate
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;

    /// Load snapshot
    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, EventStoreError>;
}

/// In-memory event store (for testing/development)
///
/// Appends hold the stream's map entry for their whole duration, so version
/// assignment for one aggregate is serialized.
#[derive(Clone)]
pub struct InMemoryEventStore {
    /// Events indexed by aggregate ID
    streams: Arc<DashMap<String, Vec<DomainEvent>>>,

    /// Snapshots indexed by aggregate ID
    snapshots: Arc<DashMap<String, Snapshot>>,
}

impl InMemoryEventStore {
    /// Create new in-memory event store
    pub fn new() -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// IDs of every aggregate with a stream
    pub fn aggregate_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of stored events across all streams
    pub fn event_count(&self) -> usize {
        self.streams.iter().map(|e| e.value().len()).sum()
    }

    /// Clear all data
    pub fn clear(&self) {
        self.streams.clear();
        self.snapshots.clear();
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &str,
        events: Vec<DomainEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        match self.streams.entry(aggregate_id.to_string()) {
            Entry::Occupied(mut stream) => {
                let current = stream.get().len() as u64;
                check_expected(aggregate_id, expected_version, current)?;
                let stored = stamp_versions(aggregate_id, events, current);
                stream.get_mut().extend(stored.iter().cloned());
                Ok(stored)
            }
            // only a non-empty, accepted batch creates a stream
            Entry::Vacant(slot) => {
                check_expected(aggregate_id, expected_version, 0)?;
                let stored = stamp_versions(aggregate_id, events, 0);
                if !stored.is_empty() {
                    slot.insert(stored.clone());
                }
                Ok(stored)
            }
        }
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        match self.streams.get(aggregate_id) {
            Some(events) => Ok(events
                .iter()
                .filter(|e| e.version > from_version)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn get_all_events(
        &self,
        event_type: Option<&str>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let mut events: Vec<DomainEvent> = self
            .streams
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .collect();

        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
                .then_with(|| a.version.cmp(&b.version))
        });

        Ok(events)
    }

    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|events| events.len() as u64)
            .unwrap_or(0))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.snapshots
            .insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, EventStoreError> {
        Ok(self.snapshots.get(aggregate_id).map(|s| s.clone()))
    }
}

fn check_expected(
    aggregate_id: &str,
    expected_version: ExpectedVersion,
    current: u64,
) -> Result<(), EventStoreError> {
    match expected_version {
        ExpectedVersion::Exact(expected) if expected != current => {
            Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual: current,
            })
        }
        _ => Ok(()),
    }
}

fn stamp_versions(aggregate_id: &str, events: Vec<DomainEvent>, current: u64) -> Vec<DomainEvent> {
    events
        .into_iter()
        .zip(current + 1..)
        .map(|(mut event, version)| {
            event.aggregate_id = aggregate_id.to_string();
            event.version = version;
            event
        })
        .collect()
}

/// Event store error
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error(
        "Concurrency conflict on {aggregate_id}: expected version {expected}, stream is at {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
