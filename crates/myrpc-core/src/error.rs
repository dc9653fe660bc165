//! Error types for the fiber runtime
//!
//! Only setup paths return these. Hooked syscalls keep POSIX return
//! conventions, and scheduler invariant violations go through `fatal!`.

use std::io;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by `FiberPool` setup and task submission
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("fiber pool is already running")]
    AlreadyRunning,

    #[error("worker {0} does not exist in this pool")]
    NoSuchWorker(usize),

    #[error("not running on a fiber pool worker")]
    NotInPool,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("fiber stack: {0}")]
    Stack(#[from] StackError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("system call failed: {0}")]
    Io(#[from] io::Error),
}

/// Fiber stack mapping errors
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("mmap of {size} byte stack failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("mprotect of guard page failed: {0}")]
    Protect(#[source] io::Error),
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}
