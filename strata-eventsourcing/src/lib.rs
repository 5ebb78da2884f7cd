//! Event Sourcing for Strata
//!
//! This crate provides the event store, event-sourced aggregates and the
//! repository that loads and saves them.
//!
//! ## Features
//!
//! - **Event Store** - Append-only per-aggregate streams with gapless versions
//! - **Optimistic Concurrency** - Appends guarded by an expected version
//! - **Aggregates** - State rebuilt by replaying events through `apply_event`
//! - **Snapshots** - Optional periodic snapshots to shorten replay
//! - **Repository** - Load/save aggregates and publish saved events on the bus
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata_eventsourcing::*;
//! use strata_events::{DomainEvent, EventBus};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Account {
//!     root: AggregateRoot,
//!     balance: i64,
//! }
//!
//! impl Account {
//!     fn deposit(&mut self, amount: i64) -> Result<(), AggregateError> {
//!         self.raise_event(DomainEvent::new(
//!             "account.credited",
//!             serde_json::json!({ "amount": amount }),
//!         ))
//!     }
//! }
//!
//! impl Aggregate for Account {
//!     fn aggregate_type() -> &'static str { "Account" }
//!
//!     fn new_instance(id: String) -> Self {
//!         Self { root: AggregateRoot::new(id), balance: 0 }
//!     }
//!
//!     fn root(&self) -> &AggregateRoot { &self.root }
//!     fn root_mut(&mut self) -> &mut AggregateRoot { &mut self.root }
//!
//!     fn apply_event(&mut self, event: &DomainEvent) -> Result<(), AggregateError> {
//!         if event.event_type == "account.credited" {
//!             self.balance += event.payload["amount"].as_i64().unwrap_or(0);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new();
//!     bus.start().await?;
//!
//!     let repo = AggregateRepository::<Account>::new(Arc::new(InMemoryEventStore::new()), bus.clone());
//!
//!     let mut account = Account::new_instance("acct-1".to_string());
//!     account.deposit(100)?;
//!     repo.save(&mut account).await?;
//!
//!     let loaded = repo.get("acct-1").await?;
//!     assert_eq!(loaded.version(), 1);
//!
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Snapshots
//!
//! ```rust,ignore
//! // Snapshot every 10 events; the aggregate must implement
//! // `snapshot_state` and `restore_state`
//! let repo = AggregateRepository::<Account>::with_snapshots(store, bus, 10);
//! ```
//!
//! ## Concurrency Conflicts
//!
//! ```rust,ignore
//! match repo.save(&mut account).await {
//!     Err(err) if err.is_concurrency_conflict() => {
//!         // Reload and run the command again
//!     }
//!     other => other?,
//! }
//! ```

pub mod aggregate;
pub mod repository;
pub mod store;

pub use aggregate::{Aggregate, AggregateError, AggregateRoot, Snapshot};
pub use repository::AggregateRepository;
pub use store::{EventStore, EventStoreError, ExpectedVersion, InMemoryEventStore};
