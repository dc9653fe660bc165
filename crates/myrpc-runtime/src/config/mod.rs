//! Fiber pool configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. User's MYRPC_CONFIG_RS file (compile-time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use myrpc_runtime::config::PoolConfig;
//!
//! let config = PoolConfig::from_env()
//!     .num_workers(8)
//!     .wait_timeout(Duration::from_millis(500));
//! config.validate()?;
//! ```

pub mod defaults;

use myrpc_core::constants::{MAX_WORKERS, MIN_STACK_SIZE};
use myrpc_core::env::env_get;
use myrpc_core::ConfigError;
use std::time::Duration;

/// Fiber pool configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Usable stack bytes per fiber (a guard page is added below)
    pub stack_size: usize,
    /// Per-worker ready queue slots; also caps tasks owned by one worker
    pub ready_queue_capacity: usize,
    /// epoll_event buffer size per `wait_event` call
    pub max_events: usize,
    /// Longest a worker sleeps in epoll when it has nothing to run
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `MYRPC_NUM_WORKERS`
    /// - `MYRPC_STACK_SIZE` - bytes
    /// - `MYRPC_READY_QUEUE_CAPACITY`
    /// - `MYRPC_MAX_EVENTS`
    /// - `MYRPC_WAIT_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("MYRPC_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("MYRPC_STACK_SIZE", defaults::STACK_SIZE),
            ready_queue_capacity: env_get(
                "MYRPC_READY_QUEUE_CAPACITY",
                defaults::READY_QUEUE_CAPACITY,
            ),
            max_events: env_get("MYRPC_MAX_EVENTS", defaults::MAX_EVENTS),
            wait_timeout: Duration::from_millis(env_get(
                "MYRPC_WAIT_TIMEOUT_MS",
                defaults::WAIT_TIMEOUT_MS,
            )),
        }
    }

    /// Compile-time defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            ready_queue_capacity: defaults::READY_QUEUE_CAPACITY,
            max_events: defaults::MAX_EVENTS,
            wait_timeout: Duration::from_millis(defaults::WAIT_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn ready_queue_capacity(mut self, cap: usize) -> Self {
        self.ready_queue_capacity = cap;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 64KB"));
        }
        if self.ready_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("ready_queue_capacity must be > 0"));
        }
        if self.max_events == 0 || self.max_events > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_events out of range"));
        }
        if self.wait_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("wait_timeout must be > 0"));
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn print(&self) {
        tracing::info!(
            num_workers = self.num_workers,
            stack_size = self.stack_size,
            ready_queue_capacity = self.ready_queue_capacity,
            max_events = self.max_events,
            wait_timeout = ?self.wait_timeout,
            "fiber pool configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiled_defaults_are_valid() {
        let config = PoolConfig::new();
        assert_eq!(config.max_events, defaults::MAX_EVENTS);
        assert_eq!(config.wait_timeout, Duration::from_millis(defaults::WAIT_TIMEOUT_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .num_workers(8)
            .stack_size(128 * 1024)
            .wait_timeout(Duration::from_millis(50));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.stack_size, 128 * 1024);
        assert_eq!(config.wait_timeout, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::new().num_workers(0).validate().is_err());
        assert!(PoolConfig::new().num_workers(1000).validate().is_err());
        assert!(PoolConfig::new().stack_size(4096).validate().is_err());
        assert!(PoolConfig::new().ready_queue_capacity(0).validate().is_err());
        assert_eq!(
            PoolConfig::new().wait_timeout(Duration::ZERO).validate(),
            Err(ConfigError::InvalidValue("wait_timeout must be > 0"))
        );
    }
}
