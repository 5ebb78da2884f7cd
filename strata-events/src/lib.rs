//! Domain events and the asynchronous event bus for Strata
//!
//! This crate provides the event envelope shared by the event store and the
//! in-process publish/subscribe bus that fans events out to handlers.
//!
//! ## Features
//!
//! - **Domain events** - Immutable, serializable envelopes scoped to an aggregate
//! - **Event Bus** - Bounded queue drained by a fixed pool of worker tasks
//! - **Fan-out** - Every handler subscribed to an event type is invoked
//! - **Failure isolation** - Failing, panicking or timed-out handlers are dead-lettered
//! - **Ordering** - Optional per-aggregate ordering with partitioned dispatch
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata_events::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct ShippingHandler;
//!
//! #[async_trait]
//! impl EventHandler for ShippingHandler {
//!     async fn handle(&self, event: &DomainEvent) -> Result<(), EventHandlerError> {
//!         println!("Shipping order {}", event.aggregate_id);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new();
//!     bus.subscribe("order.created", Arc::new(ShippingHandler));
//!     bus.start().await?;
//!
//!     bus.publish(DomainEvent::for_aggregate(
//!         "order.created",
//!         "order-1",
//!         "Order",
//!         serde_json::json!({"total": 42}),
//!     ))
//!     .await?;
//!
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! let bus = EventBusBuilder::new()
//!     .worker_count(8)                                   // Concurrent workers
//!     .queue_capacity(50_000)                            // Publish waits when full
//!     .handler_timeout(Duration::from_secs(10))          // Dead-letter slow handlers
//!     .dispatch_mode(DispatchMode::PartitionedByAggregate) // Per-aggregate ordering
//!     .build();
//! ```
//!
//! ## Dead Letters
//!
//! ```rust,ignore
//! for letter in bus.dead_letters().await {
//!     eprintln!("{} failed on {}: {}", letter.handler, letter.event.event_type, letter.error);
//! }
//!
//! // Publish the failed events again once the cause is fixed
//! bus.requeue_dead_letters().await?;
//! ```

pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod handler;

pub use bus::{BusState, BusStats, EventBus, EventBusError};
pub use config::{DispatchMode, EventBusBuilder, EventBusConfig};
pub use dead_letter::DeadLetter;
pub use event::{DomainEvent, EventPriority};
pub use handler::{EventHandler, EventHandlerError, FnHandler, HandlerFuture, handler_fn};
