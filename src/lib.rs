// Strata - Event sourcing and CQRS core for Rust
//
// This library bundles the event bus, the event store with aggregate
// repositories, and the command/query dispatcher behind one dependency.

// Re-export the event bus
pub use strata_events::*;

// Re-export optional crates
#[cfg(feature = "eventsourcing")]
pub use strata_eventsourcing;

#[cfg(feature = "cqrs")]
pub use strata_cqrs;

// Prelude for common imports
pub mod prelude {
    pub use strata_events::{
        DeadLetter, DispatchMode, DomainEvent, EventBus, EventBusBuilder, EventBusConfig,
        EventBusError, EventHandler, EventHandlerError, handler_fn,
    };

    #[cfg(feature = "eventsourcing")]
    pub use strata_eventsourcing::{
        Aggregate, AggregateError, AggregateRepository, AggregateRoot, EventStore,
        EventStoreError, ExpectedVersion, InMemoryEventStore, Snapshot,
    };

    #[cfg(feature = "cqrs")]
    pub use strata_cqrs::{
        Command, CommandError, CommandHandler, Dispatcher, Projection, ProjectionError,
        ProjectionHandler, ProjectionManager, Query, QueryError, QueryHandler,
    };
}
