//! Fiber-aware synchronization
//!
//! These primitives block the calling *fiber*, never its worker thread:
//! a contended fiber joins a FIFO wait queue (guarded by a `SpinLock`
//! that is only held for queue edits) and blocks. The releasing side
//! queues it back on the worker that owns it, notifying that worker
//! when the release happens on another thread.
//!
//! Called from a plain thread, or from a fiber that is not scheduled
//! by a pool, the same types park the OS thread instead.

mod condvar;
mod mutex;
mod rwlock;
mod sync_queue;
mod waiter;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use sync_queue::SyncQueue;
