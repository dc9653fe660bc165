//! # myrpc - fiber runtime
//!
//! Synchronous-looking code runs as thousands of stackful fibers
//! multiplexed over a few worker threads. Blocking I/O and sleeps made
//! through [`hook`] park the fiber on its worker's epoll reactor rather
//! than the thread, and [`Mutex`], [`RwLock`], [`Condvar`] and
//! [`SyncQueue`] block fibers, never workers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use myrpc::{FiberPool, PoolConfig, Mutex};
//! use std::sync::Arc;
//!
//! myrpc::init_logging();
//!
//! let pool = FiberPool::new(PoolConfig::new().num_workers(8))?;
//! pool.start()?;
//!
//! let counter = Arc::new(Mutex::new(0));
//! for _ in 0..1000 {
//!     let counter = Arc::clone(&counter);
//!     pool.run(move || *counter.lock() += 1)?;
//! }
//! pool.wait();
//! pool.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      User Code                           │
//! │      run(), suspend(), hook::read(), Mutex::lock()       │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                      FiberPool                           │
//! │     pending list, per-worker ready queues, wake fds      │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Worker   │
//!    │  + epoll  │      │  + epoll  │      │  + epoll  │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```
//!
//! ## Environment
//!
//! - `MYRPC_LOG` - log filter for [`init_logging`] (default `info`)
//! - `MYRPC_NUM_WORKERS`, `MYRPC_STACK_SIZE`, `MYRPC_READY_QUEUE_CAPACITY`,
//!   `MYRPC_MAX_EVENTS`, `MYRPC_WAIT_TIMEOUT_MS` - read by
//!   [`PoolConfig::from_env`]

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export core types
pub use myrpc_core::{
    ConfigError, FiberId, FiberStatus, PoolError, PoolResult, SpinLock, SpinLockGuard, StackError,
};

// Re-export env utilities
pub use myrpc_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use myrpc_runtime::sync::{RwLockReadGuard, RwLockWriteGuard};
pub use myrpc_runtime::{
    hook, Condvar, Event, EventFd, EventManager, Fiber, FiberController, FiberPool, Mutex,
    MutexGuard, PoolConfig, RawMutex, ReadyQueue, RwLock, SyncQueue, TimerFd,
};

/// Install a `tracing` fmt subscriber filtered by `MYRPC_LOG`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("MYRPC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

/// Run `f` in a new fiber on the calling fiber's pool
pub fn spawn<F>(f: F) -> PoolResult<FiberController>
where
    F: FnOnce() + Send + 'static,
{
    FiberPool::spawn(f)
}

/// Yield the current fiber; it runs again on the next pass
#[inline]
pub fn suspend() {
    Fiber::suspend();
}

/// Park the current fiber until something wakes it
#[inline]
pub fn block() {
    Fiber::block();
}

/// Finish the current fiber, running destructors on its stack
#[inline]
pub fn exit() {
    Fiber::exit();
}

#[inline]
pub fn current_id() -> FiberId {
    Fiber::current_id()
}

#[inline]
pub fn current_status() -> Option<FiberStatus> {
    Fiber::current_status()
}

/// Index of the pool worker running the caller
#[inline]
pub fn current_worker_id() -> Option<usize> {
    FiberPool::current_worker_id()
}

/// Sleep without holding up the worker
#[inline]
pub fn sleep(duration: std::time::Duration) {
    hook::sleep_for(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_outside_fiber() {
        assert!(current_id().is_none());
        assert_eq!(current_status(), None);
        assert_eq!(current_worker_id(), None);
        assert!(matches!(spawn(|| {}), Err(PoolError::NotInPool)));

        // Logged no-ops
        suspend();
        block();
        exit();
    }
}
