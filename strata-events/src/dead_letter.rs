//! Dead-letter records for failed handler invocations

use crate::event::DomainEvent;
use crate::handler::EventHandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A copy of an event whose handler invocation failed.
///
/// One record is kept per failing invocation. Dead letters are never retried
/// automatically; see [`EventBus::requeue_dead_letters`](crate::EventBus::requeue_dead_letters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The event that failed
    pub event: DomainEvent,

    /// Name of the failing handler
    pub handler: String,

    /// Error message
    pub error: String,

    /// Worker that ran the invocation
    pub worker_id: usize,

    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub(crate) fn new(
        event: DomainEvent,
        handler: &str,
        error: &EventHandlerError,
        worker_id: usize,
    ) -> Self {
        Self {
            event,
            handler: handler.to_string(),
            error: error.to_string(),
            worker_id,
            failed_at: Utc::now(),
        }
    }
}
