//! # myrpc-runtime
//!
//! Linux runtime for MyRPC fibers.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Guarded mmap stacks
//! - `Fiber`, the stackful coroutine
//! - `EventManager`, the per-worker epoll reactor
//! - `FiberPool`, the N:M scheduler with cross-thread wake-up
//! - Fiber-aware `Mutex`, `RwLock`, `Condvar` and `SyncQueue`
//! - The syscall hook layer that turns blocking I/O and sleeps into
//!   fiber waits

pub mod arch;
pub mod config;
pub mod event_manager;
pub mod fiber;
pub mod hook;
pub mod notifier;
pub mod pool;
pub mod ready_queue;
pub mod stack;
pub mod sync;
pub mod timer;
mod tls;

// Re-exports
pub use config::PoolConfig;
pub use event_manager::{Event, EventManager};
pub use fiber::Fiber;
pub use notifier::EventFd;
pub use pool::{FiberController, FiberPool};
pub use ready_queue::ReadyQueue;
pub use stack::FiberStack;
pub use sync::{Condvar, Mutex, MutexGuard, RawMutex, RwLock, SyncQueue};
pub use timer::TimerFd;

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("myrpc-runtime requires Linux (epoll, eventfd, timerfd)");
    }
}
