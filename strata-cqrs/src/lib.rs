//! CQRS (Command Query Responsibility Segregation) for Strata
//!
//! This crate routes commands and queries to their handlers and keeps read
//! models up to date with projections.
//!
//! ## Features
//!
//! - **Dispatcher** - One entry point for commands (writes) and queries (reads)
//! - **Type-safe** - Handlers are keyed by the concrete command/query type
//! - **Projections** - Build read models from bus events, rebuild from the store
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata_cqrs::*;
//! use async_trait::async_trait;
//!
//! struct OpenAccount {
//!     owner: String,
//! }
//!
//! impl Command for OpenAccount {
//!     type Result = String; // Account ID
//! }
//!
//! struct OpenAccountHandler {
//!     repository: AggregateRepository<Account>,
//! }
//!
//! #[async_trait]
//! impl CommandHandler<OpenAccount> for OpenAccountHandler {
//!     async fn handle(&self, command: OpenAccount) -> Result<String, CommandError> {
//!         let mut account = Account::new_instance(uuid::Uuid::new_v4().to_string());
//!         account.open(&command.owner)?;
//!
//!         // Appends, publishes on the event bus and commits
//!         self.repository.save(&mut account).await?;
//!         Ok(account.aggregate_id().to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new();
//!     dispatcher.register_command_handler::<OpenAccount, _>(OpenAccountHandler { repository });
//!
//!     let account_id = dispatcher
//!         .execute_command(OpenAccount { owner: "alice".to_string() })
//!         .await?;
//!     println!("Opened {account_id}");
//!     Ok(())
//! }
//! ```
//!
//! ## Projections
//!
//! ```rust,ignore
//! struct AccountList { /* read model storage */ }
//!
//! #[async_trait]
//! impl Projection for AccountList {
//!     async fn project(&self, event: &DomainEvent) -> Result<(), ProjectionError> {
//!         // Update read model
//!         Ok(())
//!     }
//!
//!     fn handles(&self, event_type: &str) -> bool {
//!         event_type == "account.opened"
//!     }
//! }
//!
//! let mut projections = ProjectionManager::new();
//! projections.add_projection(Arc::new(AccountList::default()));
//!
//! // Catch up from history, then follow live events
//! projections.rebuild_all(&store).await?;
//! projections.subscribe_all(&bus, ["account.opened"]);
//! ```

pub mod command;
pub mod dispatcher;
pub mod projection;
pub mod query;

pub use command::{Command, CommandBus, CommandError, CommandHandler};
pub use dispatcher::Dispatcher;
pub use projection::{Projection, ProjectionError, ProjectionHandler, ProjectionManager};
pub use query::{Query, QueryBus, QueryError, QueryHandler};
