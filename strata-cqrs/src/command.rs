//! Command handling for CQRS

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::{Any, TypeId, type_name};
use std::sync::Arc;
use strata_eventsourcing::AggregateError;
use thiserror::Error;
use tracing::debug;

/// Command trait
///
/// Commands represent write operations in CQRS.
pub trait Command: Send + Sync + 'static {
    /// Command result type
    type Result: Send + 'static;
}

/// Command handler trait
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Handle the command
    async fn handle(&self, command: C) -> Result<C::Result, CommandError>;
}

/// Command error
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("No handler registered for command {0}")]
    HandlerNotRegistered(&'static str),

    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl CommandError {
    /// Whether retrying the command after reloading state may succeed
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, CommandError::Aggregate(err) if err.is_concurrency_conflict())
    }
}

/// Type-erased command handler
#[async_trait]
trait DynCommandHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        command: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CommandError>;
}

/// Wrapper for typed command handlers
struct TypedCommandHandler<C: Command, H: CommandHandler<C>> {
    handler: H,
    _phantom: std::marker::PhantomData<C>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> DynCommandHandler for TypedCommandHandler<C, H> {
    async fn handle_dyn(
        &self,
        command: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, CommandError> {
        let command = command.downcast::<C>().map_err(|_| {
            CommandError::ExecutionFailed(format!("expected command {}", type_name::<C>()))
        })?;
        let result = self.handler.handle(*command).await?;
        Ok(Box::new(result))
    }
}

/// Command bus
///
/// Routes each command to the single handler registered for its concrete type.
pub struct CommandBus {
    handlers: DashMap<TypeId, Arc<dyn DynCommandHandler>>,
}

impl CommandBus {
    /// Create new command bus
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a command handler, replacing any previous one for `C`
    pub fn register<C, H>(&self, handler: H)
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let handler = Arc::new(TypedCommandHandler {
            handler,
            _phantom: std::marker::PhantomData,
        });

        if self.handlers.insert(TypeId::of::<C>(), handler).is_some() {
            debug!(command = type_name::<C>(), "Replaced command handler");
        } else {
            debug!(command = type_name::<C>(), "Registered command handler");
        }
    }

    /// Whether a handler is registered for `C`
    pub fn has_handler<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Execute a command
    ///
    /// Handler errors are returned unmodified.
    pub async fn execute<C>(&self, command: C) -> Result<C::Result, CommandError>
    where
        C: Command,
    {
        // Clone out of the map so no shard lock is held across the handler
        let handler = self
            .handlers
            .get(&TypeId::of::<C>())
            .map(|entry| entry.value().clone())
            .ok_or(CommandError::HandlerNotRegistered(type_name::<C>()))?;

        let result = handler.handle_dyn(Box::new(command)).await?;

        result.downcast::<C::Result>().map(|r| *r).map_err(|_| {
            CommandError::ExecutionFailed(format!(
                "handler for {} returned an unexpected result type",
                type_name::<C>()
            ))
        })
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}
