//! Combined command and query dispatch

use crate::command::{Command, CommandBus, CommandError, CommandHandler};
use crate::query::{Query, QueryBus, QueryError, QueryHandler};
use std::sync::Arc;

/// CQRS dispatcher
///
/// Owns one [`CommandBus`] and one [`QueryBus`]. Cloning is cheap and clones
/// share registrations.
#[derive(Clone, Default)]
pub struct Dispatcher {
    commands: Arc<CommandBus>,
    queries: Arc<QueryBus>,
}

impl Dispatcher {
    /// Create a dispatcher with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for command type `C`
    pub fn register_command_handler<C, H>(&self, handler: H)
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.commands.register::<C, H>(handler);
    }

    /// Register the handler for query type `Q`
    pub fn register_query_handler<Q, H>(&self, handler: H)
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        self.queries.register::<Q, H>(handler);
    }

    /// Execute a command
    pub async fn execute_command<C: Command>(&self, command: C) -> Result<C::Result, CommandError> {
        self.commands.execute(command).await
    }

    /// Execute a query
    pub async fn execute_query<Q: Query>(&self, query: Q) -> Result<Q::Result, QueryError> {
        self.queries.execute(query).await
    }

    /// Whether a handler is registered for command type `C`
    pub fn has_command_handler<C: Command>(&self) -> bool {
        self.commands.has_handler::<C>()
    }

    /// Whether a handler is registered for query type `Q`
    pub fn has_query_handler<Q: Query>(&self) -> bool {
        self.queries.has_handler::<Q>()
    }

    /// Underlying command bus
    pub fn command_bus(&self) -> &CommandBus {
        &self.commands
    }

    /// Underlying query bus
    pub fn query_bus(&self) -> &QueryBus {
        &self.queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio_test::{assert_err, assert_ok};

    struct Deposit(i64);

    impl Command for Deposit {
        type Result = i64;
    }

    struct CurrentBalance;

    impl Query for CurrentBalance {
        type Result = i64;
    }

    #[derive(Clone, Default)]
    struct Ledger {
        balance: Arc<AtomicI64>,
    }

    #[async_trait]
    impl CommandHandler<Deposit> for Ledger {
        async fn handle(&self, command: Deposit) -> Result<i64, CommandError> {
            if command.0 <= 0 {
                return Err(CommandError::BusinessRuleViolation(
                    "deposits must be positive".to_string(),
                ));
            }
            Ok(self.balance.fetch_add(command.0, Ordering::SeqCst) + command.0)
        }
    }

    #[async_trait]
    impl QueryHandler<CurrentBalance> for Ledger {
        async fn handle(&self, _query: CurrentBalance) -> Result<i64, QueryError> {
            Ok(self.balance.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_command_then_query() {
        let ledger = Ledger::default();
        let dispatcher = Dispatcher::new();
        dispatcher.register_command_handler::<Deposit, _>(ledger.clone());
        dispatcher.register_query_handler::<CurrentBalance, _>(ledger);

        assert_eq!(assert_ok!(dispatcher.execute_command(Deposit(40)).await), 40);
        assert_eq!(assert_ok!(dispatcher.execute_command(Deposit(2)).await), 42);
        assert_eq!(assert_ok!(dispatcher.execute_query(CurrentBalance).await), 42);

        assert!(dispatcher.has_command_handler::<Deposit>());
        assert!(dispatcher.has_query_handler::<CurrentBalance>());
        assert_eq!(dispatcher.command_bus().handler_count(), 1);
        assert_eq!(dispatcher.query_bus().handler_count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_command() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.has_command_handler::<Deposit>());

        let err = assert_err!(dispatcher.execute_command(Deposit(10)).await);
        assert!(matches!(err, CommandError::HandlerNotRegistered(name) if name.contains("Deposit")));

        let err = assert_err!(dispatcher.execute_query(CurrentBalance).await);
        assert!(matches!(err, QueryError::HandlerNotRegistered(name) if name.contains("CurrentBalance")));
    }

    #[tokio::test]
    async fn test_clones_share_registrations() {
        let dispatcher = Dispatcher::new();
        let clone = dispatcher.clone();
        dispatcher.register_command_handler::<Deposit, _>(Ledger::default());

        assert!(clone.has_command_handler::<Deposit>());
        let err = assert_err!(clone.execute_command(Deposit(0)).await);
        assert!(matches!(err, CommandError::BusinessRuleViolation(_)));
    }
}
