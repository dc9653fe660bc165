//! Fiber pool: N worker threads multiplexing M fibers
//!
//! ```text
//!   run(f) ──> pending (SpinLock<VecDeque>) ──notify──> worker i
//!                                                        │ take_pending
//!                                                        v
//!   FiberWaker::wake ──> ready queue i ──> resume ──> Ready: requeue
//!                                             │        Blocked: parked
//!   EventManager i ──── fd fired ─────────────┘        Terminal: reap
//! ```
//!
//! A fiber is owned by the worker that first took it and is only ever
//! resumed on that worker's thread.

pub(crate) mod task;
pub(crate) mod worker;

pub use task::FiberController;

use crate::config::PoolConfig;
use crate::event_manager::EventManager;
use crate::fiber::Fiber;
use crate::notifier::EventFd;
use crate::ready_queue::ReadyQueue;
use myrpc_core::{fatal, FiberId, FiberStatus, PoolError, PoolResult, SpinLock};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use task::Task;
use tracing::{error, info, warn};
use worker::WorkerContext;

/// Interval between polls in `stop` and `wait`
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) struct WorkerSlot {
    /// Entries are (task, resume epoch at wake time)
    pub(crate) queue: ReadyQueue<(Arc<Task>, u64)>,
    pub(crate) waker: Arc<EventFd>,
}

/// State shared by the pool handle and all of its workers
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) workers: Vec<WorkerSlot>,
    /// Registered in every worker's reactor; rouses whichever is idle
    pub(crate) global: EventFd,
    pub(crate) pending: SpinLock<VecDeque<Arc<Task>>>,
    pub(crate) stopping: AtomicBool,
    /// Submitted tasks not yet reaped
    pub(crate) tasks: AtomicUsize,
}

impl PoolShared {
    /// Push onto worker `index`'s ready queue. A full queue means the
    /// worker cannot keep up and is fatal.
    pub(crate) fn enqueue(&self, index: usize, task: Arc<Task>, epoch: u64) {
        if let Err((task, _)) = self.workers[index].queue.push((task, epoch)) {
            fatal!(worker = index, fiber = %task.id(), "ready queue is full");
        }
    }

    pub(crate) fn notify(&self, index: usize) {
        if let Err(e) = self.workers[index].waker.notify() {
            warn!(worker = index, "wake-up write failed: {}", e);
        }
    }

    pub(crate) fn notify_all(&self) {
        for index in 0..self.workers.len() {
            self.notify(index);
        }
    }

    fn submit(&self, fiber: Arc<Fiber>, preferred: Option<usize>) -> Arc<Task> {
        let task = Arc::new(Task::new(fiber, preferred));
        self.tasks.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().push_back(Arc::clone(&task));

        match preferred {
            Some(index) => self.notify(index),
            None => {
                if let Err(e) = self.global.notify() {
                    warn!("pool wake-up write failed: {}", e);
                }
            }
        }
        task
    }
}

/// N:M fiber scheduler over a fixed set of worker threads
pub struct FiberPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl FiberPool {
    /// Build a pool. No threads run until `start`.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        // Stale wake-up entries can sit beside live ones, so leave headroom
        // over the per-worker task cap
        let queue_slots = config.ready_queue_capacity.saturating_mul(2);
        let workers = (0..config.num_workers)
            .map(|_| -> PoolResult<WorkerSlot> {
                Ok(WorkerSlot {
                    queue: ReadyQueue::new(queue_slots),
                    waker: Arc::new(EventFd::new().map_err(io::Error::from)?),
                })
            })
            .collect::<PoolResult<Vec<_>>>()?;

        let shared = Arc::new(PoolShared {
            workers,
            global: EventFd::new().map_err(io::Error::from)?,
            pending: SpinLock::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
            tasks: AtomicUsize::new(0),
            config,
        });

        Ok(Self {
            shared,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Pool with `PoolConfig::from_env()`
    pub fn from_env() -> PoolResult<Self> {
        Self::new(PoolConfig::from_env())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Submitted tasks that have not finished yet
    pub fn live_tasks(&self) -> usize {
        self.shared.tasks.load(Ordering::Acquire)
    }

    /// Launch the worker threads
    pub fn start(&self) -> PoolResult<()> {
        let mut handles = self.lock_handles();
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyRunning);
        }
        self.shared.stopping.store(false, Ordering::Release);

        for index in 0..self.shared.workers.len() {
            match self.spawn_worker(index) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = index, "worker failed to start: {}", e);
                    self.shutdown_workers(&mut handles);
                    return Err(e);
                }
            }
        }

        info!(workers = handles.len(), "fiber pool started");
        Ok(())
    }

    fn spawn_worker(&self, index: usize) -> PoolResult<JoinHandle<()>> {
        let slot = &self.shared.workers[index];
        let events = EventManager::with_waker(self.shared.config.max_events, Arc::clone(&slot.waker))
            .map_err(io::Error::from)?;
        events
            .add_wakeup_eventfd(self.shared.global.as_raw_fd())
            .map_err(io::Error::from)?;

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("myrpc-worker-{}", index))
            .spawn(move || worker::run(index, shared, events))
            .map_err(PoolError::Spawn)
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Fibers still parked on a worker are unwound there; submitted tasks
    /// no worker took are dropped. Idempotent, and the pool may be
    /// started again afterwards. Calling it from one of this pool's own
    /// workers is a logged no-op.
    pub fn stop(&self) {
        if self.is_own_worker() {
            warn!("FiberPool::stop called from one of its own workers");
            return;
        }

        let mut handles = self.lock_handles();
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.shutdown_workers(&mut handles);
        info!("fiber pool stopped");
    }

    fn shutdown_workers(&self, handles: &mut Vec<JoinHandle<()>>) {
        self.shared.stopping.store(true, Ordering::Release);

        // Repeat until no worker can still be parked in epoll_wait
        while handles.iter().any(|h| !h.is_finished()) {
            self.shared.notify_all();
            thread::sleep(POLL_INTERVAL);
        }
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        let pending: Vec<_> = self.shared.pending.lock().drain(..).collect();
        for task in pending {
            task.fiber.term();
            task.mark_stopped();
            self.shared.tasks.fetch_sub(1, Ordering::AcqRel);
        }

        self.running.store(false, Ordering::Release);
    }

    /// Block until every submitted fiber has finished.
    ///
    /// Returns at once if the pool is not running, and is a logged no-op
    /// on one of this pool's own workers, where it could never return.
    pub fn wait(&self) {
        if self.is_own_worker() {
            warn!("FiberPool::wait called from one of its own workers");
            return;
        }
        while self.is_running() && self.shared.tasks.load(Ordering::Acquire) > 0 {
            if Fiber::current_id().is_some() {
                Fiber::suspend();
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Wake worker `index` out of its reactor wait
    pub fn notify(&self, index: usize) -> PoolResult<()> {
        if index >= self.shared.workers.len() {
            return Err(PoolError::NoSuchWorker(index));
        }
        self.shared.notify(index);
        Ok(())
    }

    /// Wake every worker
    pub fn notify_all(&self) {
        self.shared.notify_all();
    }

    /// Run `f` in a new fiber on whichever worker picks it up
    pub fn run<F>(&self, f: F) -> PoolResult<FiberController>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::with_stack_size(self.shared.config.stack_size, f)?;
        Ok(FiberController::new(self.shared.submit(fiber, None)))
    }

    /// Run `f` in a new fiber pinned to worker `index`
    pub fn run_on<F>(&self, f: F, index: usize) -> PoolResult<FiberController>
    where
        F: FnOnce() + Send + 'static,
    {
        if index >= self.shared.workers.len() {
            return Err(PoolError::NoSuchWorker(index));
        }
        let fiber = Fiber::with_stack_size(self.shared.config.stack_size, f)?;
        Ok(FiberController::new(self.shared.submit(fiber, Some(index))))
    }

    /// Run `f` on the pool the calling fiber belongs to
    pub fn spawn<F>(f: F) -> PoolResult<FiberController>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = WorkerContext::with(|ctx| Arc::clone(&ctx.shared)).ok_or(PoolError::NotInPool)?;
        let fiber = Fiber::with_stack_size(shared.config.stack_size, f)?;
        Ok(FiberController::new(shared.submit(fiber, None)))
    }

    /// Index of the worker running the calling thread, if it is one
    pub fn current_worker_id() -> Option<usize> {
        WorkerContext::with(|ctx| ctx.index)
    }

    pub fn current_fiber_id() -> FiberId {
        Fiber::current_id()
    }

    pub fn current_fiber_status() -> Option<FiberStatus> {
        Fiber::current_status()
    }

    /// Borrow the calling worker's reactor
    pub fn with_event_manager<R>(f: impl FnOnce(&EventManager) -> R) -> Option<R> {
        WorkerContext::with(|ctx| f(&ctx.events))
    }

    fn is_own_worker(&self) -> bool {
        WorkerContext::with(|ctx| Arc::ptr_eq(&ctx.shared, &self.shared)).unwrap_or(false)
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for FiberPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberPool")
            .field("num_workers", &self.num_workers())
            .field("running", &self.is_running())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}
