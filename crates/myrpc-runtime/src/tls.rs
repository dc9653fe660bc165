//! Thread-local runtime state
//!
//! Three cells per OS thread:
//! - the fiber currently executing on this thread (null on the thread's own stack)
//! - the hook-enabled flag, swapped in and out with each fiber
//! - the pool worker context when the thread is a pool worker
//!
//! The raw pointers are only dereferenced through the owning modules,
//! which guarantee the pointee outlives the period it is installed.

use crate::fiber::Fiber;
use crate::pool::worker::WorkerContext;
use std::cell::Cell;
use std::ptr;

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };

    static WORKER: Cell<*const WorkerContext> = const { Cell::new(ptr::null()) };
}

#[inline]
pub(crate) fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Install `fiber` as current, returning the previous value
#[inline]
pub(crate) fn replace_current_fiber(fiber: *const Fiber) -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.replace(fiber))
}

/// Whether hooked calls on this thread take the fiber path
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

/// Set the hook flag, returning the previous value
#[inline]
pub fn set_hook_enabled(on: bool) -> bool {
    HOOK_ENABLED.with(|cell| cell.replace(on))
}

#[inline]
pub(crate) fn worker() -> *const WorkerContext {
    WORKER.with(|cell| cell.get())
}

#[inline]
pub(crate) fn replace_worker(ctx: *const WorkerContext) -> *const WorkerContext {
    WORKER.with(|cell| cell.replace(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_fresh_thread() {
        std::thread::spawn(|| {
            assert!(current_fiber().is_null());
            assert!(worker().is_null());
            assert!(!hook_enabled());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_hook_flag_swap() {
        let prev = set_hook_enabled(true);
        assert!(hook_enabled());
        assert!(set_hook_enabled(prev));
        assert_eq!(hook_enabled(), prev);
    }
}
