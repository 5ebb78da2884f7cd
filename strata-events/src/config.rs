//! Event bus configuration

use crate::bus::{EventBus, EventBusError};
use std::env;
use std::time::Duration;

/// How published events are mapped onto worker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// All workers drain one shared queue.
    ///
    /// Two events of the same aggregate may be dispatched out of publish order
    /// when they are picked up by different workers.
    #[default]
    Shared,

    /// Each worker owns a queue; events are routed by a stable hash of their
    /// aggregate ID, so one aggregate's events are dispatched in publish order.
    PartitionedByAggregate,
}

impl DispatchMode {
    /// Parse a dispatch mode name.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shared" => Some(DispatchMode::Shared),
            "partitioned" | "partitioned_by_aggregate" => {
                Some(DispatchMode::PartitionedByAggregate)
            }
            _ => None,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Number of concurrent workers
    pub worker_count: usize,

    /// Total capacity of the dispatch queue(s); `publish` waits when full
    pub queue_capacity: usize,

    /// How long a worker waits on an empty queue before re-checking for stop
    pub poll_interval: Duration,

    /// How long `stop` waits for workers before aborting them
    pub shutdown_grace: Duration,

    /// Per-invocation handler timeout
    pub handler_timeout: Option<Duration>,

    /// Queue routing policy
    pub dispatch_mode: DispatchMode,

    /// Enable event logging
    pub enable_logging: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 10_000,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            handler_timeout: None,
            dispatch_mode: DispatchMode::Shared,
            enable_logging: true,
        }
    }
}

impl EventBusConfig {
    /// Create config from environment variables.
    ///
    /// - `STRATA_BUS_WORKERS`
    /// - `STRATA_BUS_QUEUE_CAPACITY`
    /// - `STRATA_BUS_POLL_INTERVAL_MS`
    /// - `STRATA_BUS_SHUTDOWN_GRACE_MS`
    /// - `STRATA_BUS_HANDLER_TIMEOUT_MS`
    /// - `STRATA_BUS_DISPATCH_MODE=shared|partitioned`
    /// - `STRATA_BUS_LOGGING=1|0`
    ///
    /// Missing or unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count = env_parse("STRATA_BUS_WORKERS").unwrap_or(defaults.worker_count);
        let queue_capacity =
            env_parse("STRATA_BUS_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity);
        let poll_interval = env_parse("STRATA_BUS_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let shutdown_grace = env_parse("STRATA_BUS_SHUTDOWN_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace);
        let handler_timeout = env_parse("STRATA_BUS_HANDLER_TIMEOUT_MS")
            .map(Duration::from_millis)
            .or(defaults.handler_timeout);
        let dispatch_mode = env::var("STRATA_BUS_DISPATCH_MODE")
            .ok()
            .and_then(|s| DispatchMode::from_name(&s))
            .unwrap_or(defaults.dispatch_mode);
        let enable_logging = env::var("STRATA_BUS_LOGGING")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(defaults.enable_logging);

        Self {
            worker_count,
            queue_capacity,
            poll_interval,
            shutdown_grace,
            handler_timeout,
            dispatch_mode,
            enable_logging,
        }
    }

    /// Check the configuration for values the bus cannot run with.
    pub fn validate(&self) -> Result<(), EventBusError> {
        if self.worker_count == 0 {
            return Err(EventBusError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EventBusError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.dispatch_mode == DispatchMode::PartitionedByAggregate
            && self.queue_capacity < self.worker_count
        {
            return Err(EventBusError::InvalidConfig(
                "queue_capacity must be at least worker_count in partitioned mode".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Event bus builder
pub struct EventBusBuilder {
    config: EventBusConfig,
}

impl EventBusBuilder {
    /// Create new event bus builder
    pub fn new() -> Self {
        Self {
            config: EventBusConfig::default(),
        }
    }

    /// Set the number of workers
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Set the queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the dequeue poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Set a per-invocation handler timeout
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = Some(timeout);
        self
    }

    /// Set the dispatch mode
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config.dispatch_mode = mode;
        self
    }

    /// Enable/disable logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Build the event bus
    pub fn build(self) -> EventBus {
        EventBus::with_config(self.config)
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EventBusConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.dispatch_mode, DispatchMode::Shared);
        assert!(config.handler_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = EventBusConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EventBusError::InvalidConfig(_))
        ));

        let config = EventBusConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventBusConfig {
            worker_count: 8,
            queue_capacity: 4,
            dispatch_mode: DispatchMode::PartitionedByAggregate,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatch_mode_names() {
        assert_eq!(DispatchMode::from_name("shared"), Some(DispatchMode::Shared));
        assert_eq!(
            DispatchMode::from_name("Partitioned"),
            Some(DispatchMode::PartitionedByAggregate)
        );
        assert_eq!(DispatchMode::from_name("round-robin"), None);
    }

    #[test]
    fn test_builder() {
        let bus = EventBusBuilder::new()
            .worker_count(2)
            .queue_capacity(16)
            .handler_timeout(Duration::from_millis(250))
            .dispatch_mode(DispatchMode::PartitionedByAggregate)
            .enable_logging(false)
            .build();

        let config = bus.config();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.handler_timeout, Some(Duration::from_millis(250)));
        assert!(!config.enable_logging);
    }
}
