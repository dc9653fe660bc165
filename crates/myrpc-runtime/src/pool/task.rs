//! Task bookkeeping and spawn handles

use crate::fiber::Fiber;
use myrpc_core::FiberId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A submitted fiber plus the worker it should run on.
///
/// Lives from `run` until the owning worker reaps the TERMINAL fiber,
/// or until the pool drops it during `stop`.
pub(crate) struct Task {
    pub(crate) fiber: Arc<Fiber>,
    /// `None` lets any worker take it
    pub(crate) preferred: Option<usize>,
    stopped: AtomicBool,
}

impl Task {
    pub(crate) fn new(fiber: Arc<Fiber>, preferred: Option<usize>) -> Self {
        Self {
            fiber,
            preferred,
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> FiberId {
        self.fiber.id()
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Handle returned by `FiberPool::run`
#[derive(Clone)]
pub struct FiberController {
    task: Arc<Task>,
}

impl FiberController {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    /// Id of the spawned fiber
    pub fn id(&self) -> FiberId {
        self.task.id()
    }

    /// Whether the fiber has finished or was discarded by `stop`
    pub fn is_stopped(&self) -> bool {
        self.task.is_stopped()
    }

    /// Wait for the fiber to stop.
    ///
    /// Inside a fiber this yields so the worker keeps running other
    /// fibers; on a plain thread it sleeps between polls.
    pub fn join(&self) {
        while !self.is_stopped() {
            if Fiber::current_id().is_some() {
                Fiber::suspend();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl fmt::Debug for FiberController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberController")
            .field("id", &self.id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_returns_once_stopped() {
        let fiber = Fiber::new(|| {}).unwrap();
        let task = Arc::new(Task::new(fiber, None));
        let controller = FiberController::new(Arc::clone(&task));
        assert!(!controller.is_stopped());
        assert_eq!(controller.id(), task.id());

        let t = Arc::clone(&task);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            t.mark_stopped();
        });
        controller.join();
        assert!(controller.is_stopped());
        handle.join().unwrap();
    }
}
