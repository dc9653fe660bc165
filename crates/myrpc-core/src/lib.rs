//! # myrpc-core
//!
//! Core types for the MyRPC fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching, the reactor and the scheduler live in
//! `myrpc-runtime`.
//!
//! ## Modules
//!
//! - `id` - Process-unique fiber identifiers
//! - `state` - Fiber status enum
//! - `spinlock` - Busy-wait lock for O(1) metadata edits
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod spinlock;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberStatus;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use error::{ConfigError, PoolError, PoolResult, StackError};
pub use env::{env_get, env_get_bool, env_get_opt};

#[doc(hidden)]
pub use tracing as __tracing;

/// Log an unrecoverable scheduler condition and abort the process.
///
/// Used where the runtime can no longer make forward progress
/// (reactor failure, full ready queue). Never unwinds.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        $crate::__tracing::error!($($arg)+);
        ::std::process::abort()
    }};
}

/// Constants shared by the runtime crates
pub mod constants {
    /// Guard page size below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be configured with
    pub const MIN_STACK_SIZE: usize = 64 * 1024;

    /// Upper bound on worker threads in one pool
    pub const MAX_WORKERS: usize = 256;

    /// Return value of timeout-aware hooked calls when the deadline fires first
    pub const TIMEOUT_SENTINEL: i32 = -2;
}
