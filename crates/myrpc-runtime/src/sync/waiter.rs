//! Wait-queue slot shared by the fiber-aware locks
//!
//! A `Waiter` is pushed onto a lock's FIFO queue and parked. Whoever
//! pops it calls `grant`, which sets the flag and makes the waiter
//! runnable again: a pool fiber is queued on the worker that owns it, a
//! plain thread is unparked. Parking loops until the flag is set, so a
//! stray resume never lets a waiter through early.

use crate::event_manager::{Event, EventManager};
use crate::fiber::Fiber;
use crate::hook::HookGuard;
use crate::pool::worker::{FiberWaker, WorkerContext};
use crate::timer::TimerFd;
use myrpc_core::SpinLock;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;
use tracing::warn;

/// FIFO of parked waiters. The head is always the next grantee.
pub(crate) type WaitQueue = SpinLock<VecDeque<Arc<Waiter>>>;

#[derive(Clone)]
enum Parker {
    Fiber(FiberWaker),
    Thread(Thread),
}

impl Parker {
    fn current() -> Self {
        match FiberWaker::current() {
            Some(waker) => Parker::Fiber(waker),
            None => Parker::Thread(thread::current()),
        }
    }

    fn unpark(self) {
        match self {
            Parker::Fiber(waker) => waker.wake(),
            Parker::Thread(thread) => thread.unpark(),
        }
    }
}

pub(crate) struct Waiter {
    granted: AtomicBool,
    parker: SpinLock<Parker>,
}

impl Waiter {
    /// Slot for the calling fiber, or the calling thread outside a pool
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            granted: AtomicBool::new(false),
            parker: SpinLock::new(Parker::current()),
        })
    }

    #[inline]
    pub(crate) fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    /// Mark granted and wake the owner. Call after the waiter has left
    /// its queue and with no SpinLock held.
    pub(crate) fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
        let parker = self.parker.lock().clone();
        parker.unpark();
    }

    /// Park until granted
    pub(crate) fn wait(&self) {
        self.wait_until(None);
    }

    /// Park until granted or until `deadline`. Returns whether granted.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let on_fiber = matches!(*self.parker.lock(), Parker::Fiber(_));
        if on_fiber {
            self.park_fiber(deadline)
        } else {
            self.park_thread(deadline)
        }
    }

    fn park_thread(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.is_granted() {
                return true;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    fn park_fiber(&self, deadline: Option<Instant>) -> bool {
        WorkerContext::with(|ctx| {
            let deadline = deadline.and_then(|d| Deadline::arm(&ctx.events, d));
            loop {
                // Re-capture the resume epoch each round so the grant
                // targets this block and not an earlier one
                *self.parker.lock() = Parker::current();
                if self.is_granted() {
                    return true;
                }
                if deadline.as_ref().is_some_and(Deadline::expired) {
                    return false;
                }
                Fiber::block();
            }
        })
        .unwrap_or_else(|| self.park_thread(None))
    }
}

/// Timer registered on the worker's reactor for a bounded fiber wait
struct Deadline<'a> {
    events: &'a EventManager,
    timer: TimerFd,
}

impl<'a> Deadline<'a> {
    fn arm(events: &'a EventManager, at: Instant) -> Option<Self> {
        let _hooks = HookGuard::disable();
        let timer = match TimerFd::oneshot(at.saturating_duration_since(Instant::now())) {
            Ok(timer) => timer,
            Err(e) => {
                warn!("timerfd creation failed ({}), waiting without deadline", e);
                return None;
            }
        };
        if let Err(e) = events.add_io_event(timer.as_raw_fd(), Event::READ, Fiber::current_id()) {
            warn!("timer registration failed ({}), waiting without deadline", e);
            return None;
        }
        Some(Self { events, timer })
    }

    fn fd(&self) -> RawFd {
        self.timer.as_raw_fd()
    }

    /// The reactor drops the registration when the timer fires
    fn expired(&self) -> bool {
        !self.events.is_exist_io_event(self.fd(), Event::READ)
    }
}

impl Drop for Deadline<'_> {
    fn drop(&mut self) {
        let _hooks = HookGuard::disable();
        self.events.remove_io_event(self.fd(), Event::READ);
    }
}

/// Take `waiter` out of `queue`. False means it was already popped,
/// so a grant is owed to it.
pub(crate) fn withdraw(queue: &WaitQueue, waiter: &Arc<Waiter>) -> bool {
    let mut queue = queue.lock();
    match queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
        Some(at) => {
            queue.remove(at);
            true
        }
        None => false,
    }
}
