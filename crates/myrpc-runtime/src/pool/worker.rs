//! Worker thread scheduling loop
//!
//! Each worker owns the tasks it has taken from the pending list. A task
//! never leaves its worker: wake-ups from other threads are pushed onto
//! the owner's ready queue and the owner is notified through its eventfd.
//!
//! One pass of the loop:
//! 1. take pending tasks while there is room
//! 2. resume everything queued at the start of the pass
//! 3. wait on the reactor, resuming fibers whose fds fired

use super::task::Task;
use super::PoolShared;
use crate::event_manager::EventManager;
use crate::tls;
use myrpc_core::{FiberId, FiberStatus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-worker state. Lives on the worker thread's own stack for the
/// whole loop and is reachable from fibers through a thread-local.
pub(crate) struct WorkerContext {
    pub(crate) index: usize,
    pub(crate) shared: Arc<PoolShared>,
    pub(crate) events: EventManager,
    tasks: RefCell<HashMap<FiberId, Arc<Task>>>,
    /// Task being resumed right now
    current: RefCell<Option<Arc<Task>>>,
}

impl WorkerContext {
    fn new(index: usize, shared: Arc<PoolShared>, events: EventManager) -> Self {
        Self {
            index,
            shared,
            events,
            tasks: RefCell::new(HashMap::new()),
            current: RefCell::new(None),
        }
    }

    /// Run `f` against this thread's worker context, if it is a worker
    pub(crate) fn with<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
        let ptr = tls::worker();
        if ptr.is_null() {
            return None;
        }
        // Safety: installed by `run` for the lifetime of the loop
        Some(f(unsafe { &*ptr }))
    }

    pub(crate) fn current_task(&self) -> Option<Arc<Task>> {
        self.current.borrow().clone()
    }

    /// Whether `id` is the task this worker is resuming right now
    pub(crate) fn is_current(&self, id: FiberId) -> bool {
        self.current.borrow().as_ref().is_some_and(|t| t.id() == id)
    }

    fn run(&self) {
        while !self.shared.stopping.load(Ordering::Acquire) {
            self.take_pending();
            self.run_ready();
            self.wait();
        }
        self.shutdown();
    }

    /// Move pending tasks into this worker.
    ///
    /// Tasks pinned here are always taken while there is room. Unpinned
    /// tasks are split across workers: each pass takes at most its share
    /// and pokes the others for the rest.
    fn take_pending(&self) {
        let owned = self.tasks.borrow().len();
        let capacity = self.shared.config.ready_queue_capacity;
        if owned >= capacity {
            return;
        }
        let mut room = capacity - owned;

        let mut taken = Vec::new();
        let mut poke = vec![false; self.shared.workers.len()];
        let mut spread = false;
        {
            let mut pending = self.shared.pending.lock();
            if pending.is_empty() {
                return;
            }
            let unpinned = pending.iter().filter(|t| t.preferred.is_none()).count();
            let mut share = unpinned.div_ceil(self.shared.workers.len());

            pending.retain(|task| match task.preferred {
                Some(w) if w == self.index => {
                    if room == 0 {
                        return true;
                    }
                    room -= 1;
                    taken.push(Arc::clone(task));
                    false
                }
                Some(w) => {
                    poke[w] = true;
                    true
                }
                None => {
                    if room == 0 || share == 0 {
                        spread |= share == 0;
                        return true;
                    }
                    room -= 1;
                    share -= 1;
                    taken.push(Arc::clone(task));
                    false
                }
            });
        }

        if spread {
            poke.iter_mut().for_each(|p| *p = true);
        }
        for (w, _) in poke.iter().enumerate().filter(|(w, p)| **p && *w != self.index) {
            self.shared.notify(w);
        }

        if !taken.is_empty() {
            debug!(worker = self.index, count = taken.len(), "took pending tasks");
        }
        let mut tasks = self.tasks.borrow_mut();
        for task in taken {
            tasks.insert(task.id(), Arc::clone(&task));
            let epoch = task.fiber.resume_epoch();
            self.shared.enqueue(self.index, task, epoch);
        }
    }

    /// Resume every entry queued at the start of the pass. Fibers that
    /// yield READY go to the tail and run again next pass.
    fn run_ready(&self) {
        let queue = &self.shared.workers[self.index].queue;
        for _ in 0..queue.len() {
            let Some((task, epoch)) = queue.pop() else {
                break;
            };
            // Resumed since this wake-up was queued
            if task.fiber.resume_epoch() != epoch {
                continue;
            }
            self.dispatch(task);
        }
    }

    fn wait(&self) {
        let timeout = if self.shared.workers[self.index].queue.is_empty() {
            self.shared.config.wait_timeout
        } else {
            Duration::ZERO
        };
        self.events.wait_event(timeout, |id| {
            let task = self.tasks.borrow().get(&id).cloned();
            match task {
                Some(task) => self.dispatch(task),
                None => debug!(worker = self.index, fiber = %id, "readiness for unknown fiber"),
            }
        });
    }

    /// Resume `task` once and file it by the status it comes back with
    fn dispatch(&self, task: Arc<Task>) {
        if !task.fiber.status().is_resumable() {
            return;
        }

        let prev = self.current.replace(Some(Arc::clone(&task)));
        task.fiber.resume();
        self.current.replace(prev);

        match task.fiber.status() {
            FiberStatus::Ready => {
                let epoch = task.fiber.resume_epoch();
                self.shared.enqueue(self.index, task, epoch);
            }
            FiberStatus::Blocked => {}
            FiberStatus::Terminal | FiberStatus::Error => self.reap(&task),
            FiberStatus::Exec => warn!(fiber = %task.id(), "fiber still executing after resume"),
        }
    }

    fn reap(&self, task: &Task) {
        if self.tasks.borrow_mut().remove(&task.id()).is_some() {
            task.mark_stopped();
            self.shared.tasks.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Unwind every fiber still owned here, on this thread
    fn shutdown(&self) {
        let owned: Vec<Arc<Task>> = self.tasks.borrow_mut().drain().map(|(_, t)| t).collect();
        if !owned.is_empty() {
            debug!(worker = self.index, count = owned.len(), "terminating parked fibers");
        }

        for task in owned {
            let prev = self.current.replace(Some(Arc::clone(&task)));
            task.fiber.term();
            self.current.replace(prev);

            let status = task.fiber.status();
            if !status.is_terminal() {
                warn!(fiber = %task.id(), %status, "fiber did not finish unwinding");
            }
            task.mark_stopped();
            self.shared.tasks.fetch_sub(1, Ordering::AcqRel);
        }

        let queue = &self.shared.workers[self.index].queue;
        while queue.pop().is_some() {}
    }
}

/// Thread body of worker `index`
pub(crate) fn run(index: usize, shared: Arc<PoolShared>, events: EventManager) {
    let ctx = WorkerContext::new(index, shared, events);
    let prev = tls::replace_worker(&ctx);
    info!(worker = index, "worker started");

    ctx.run();

    tls::replace_worker(prev);
    info!(worker = index, "worker exited");
}

/// Handle that makes a parked fiber runnable again from any thread.
///
/// Captures the fiber's resume epoch when created; if the fiber has been
/// resumed by something else before the wake-up is processed, the stale
/// queue entry is skipped.
#[derive(Clone)]
pub(crate) struct FiberWaker {
    task: Arc<Task>,
    worker: usize,
    epoch: u64,
    shared: Arc<PoolShared>,
}

impl FiberWaker {
    /// Waker for the fiber running on this worker; `None` outside a
    /// pool-scheduled fiber.
    pub(crate) fn current() -> Option<Self> {
        WorkerContext::with(|ctx| {
            let task = ctx.current_task()?;
            Some(FiberWaker {
                epoch: task.fiber.resume_epoch(),
                worker: ctx.index,
                shared: Arc::clone(&ctx.shared),
                task,
            })
        })
        .flatten()
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.task.id()
    }

    /// Queue the fiber on its owning worker and notify it if that worker
    /// is not the calling thread.
    pub(crate) fn wake(self) {
        let on_owner = WorkerContext::with(|ctx| {
            ctx.index == self.worker && Arc::ptr_eq(&ctx.shared, &self.shared)
        })
        .unwrap_or(false);

        self.shared.enqueue(self.worker, self.task, self.epoch);
        if !on_owner {
            self.shared.notify(self.worker);
        }
    }
}
