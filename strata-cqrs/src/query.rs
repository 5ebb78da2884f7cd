//! Query handling for CQRS

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::{Any, TypeId, type_name};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Query trait
///
/// Queries represent read operations in CQRS.
pub trait Query: Send + Sync + 'static {
    /// Query result type
    type Result: Send + 'static;
}

/// Query handler trait
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    /// Handle the query
    async fn handle(&self, query: Q) -> Result<Q::Result, QueryError>;
}

/// Query error
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No handler registered for query {0}")]
    HandlerNotRegistered(&'static str),

    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Invalid query parameters: {0}")]
    InvalidParameters(String),
}

#[async_trait]
trait DynQueryHandler: Send + Sync {
    async fn handle_dyn(&self, query: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>, QueryError>;
}

struct TypedQueryHandler<Q: Query, H: QueryHandler<Q>> {
    handler: H,
    _phantom: std::marker::PhantomData<Q>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q>> DynQueryHandler for TypedQueryHandler<Q, H> {
    async fn handle_dyn(&self, query: Box<dyn Any + Send>) -> Result<Box<dyn Any + Send>, QueryError> {
        let query = query
            .downcast::<Q>()
            .map_err(|_| QueryError::ExecutionFailed(format!("expected query {}", type_name::<Q>())))?;
        let result = self.handler.handle(*query).await?;
        Ok(Box::new(result))
    }
}

/// Query bus
pub struct QueryBus {
    handlers: DashMap<TypeId, Arc<dyn DynQueryHandler>>,
}

impl QueryBus {
    /// Create new query bus
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a query handler, replacing any previous one for `Q`
    pub fn register<Q, H>(&self, handler: H)
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let handler = Arc::new(TypedQueryHandler {
            handler,
            _phantom: std::marker::PhantomData,
        });

        if self.handlers.insert(TypeId::of::<Q>(), handler).is_some() {
            debug!(query = type_name::<Q>(), "Replaced query handler");
        } else {
            debug!(query = type_name::<Q>(), "Registered query handler");
        }
    }

    /// Whether a handler is registered for `Q`
    pub fn has_handler<Q: Query>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<Q>())
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Execute a query
    pub async fn execute<Q>(&self, query: Q) -> Result<Q::Result, QueryError>
    where
        Q: Query,
    {
        let handler = self
            .handlers
            .get(&TypeId::of::<Q>())
            .map(|entry| entry.value().clone())
            .ok_or(QueryError::HandlerNotRegistered(type_name::<Q>()))?;

        let result = handler.handle_dyn(Box::new(query)).await?;

        result.downcast::<Q::Result>().map(|r| *r).map_err(|_| {
            QueryError::ExecutionFailed(format!(
                "handler for {} returned an unexpected result type",
                type_name::<Q>()
            ))
        })
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}
