//! Condition variable over the fiber-aware `Mutex`
//!
//! Monitor semantics: `wait` queues the caller, releases the mutex,
//! parks, and re-acquires the mutex before returning. Notification
//! order is FIFO.

use super::mutex::MutexGuard;
use super::waiter::{withdraw, WaitQueue, Waiter};
use myrpc_core::SpinLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Condvar {
    waiters: WaitQueue,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Release `guard`, park until notified, then lock again
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait_inner(guard, None).0
    }

    /// Wait while `condition` holds
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Like `wait`, bounded by `timeout`. The flag is true when the wait
    /// ended on the deadline rather than a notification.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        self.wait_inner(guard, Some(Instant::now() + timeout))
    }

    /// Wake the longest waiter
    pub fn notify_one(&self) {
        let head = self.waiters.lock().pop_front();
        if let Some(waiter) = head {
            waiter.grant();
        }
    }

    /// Wake every waiter, oldest first
    pub fn notify_all(&self) {
        let all = std::mem::take(&mut *self.waiters.lock());
        for waiter in all {
            waiter.grant();
        }
    }

    /// Number of parked waiters right now
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn wait_inner<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = guard.mutex;
        let waiter = Waiter::new();
        self.waiters.lock().push_back(Arc::clone(&waiter));
        drop(guard);

        let mut queued = Queued {
            condvar: self,
            waiter,
            armed: true,
        };
        let notified = queued.waiter.wait_until(deadline);
        queued.armed = false;
        // A notification that raced the deadline still counts
        let timed_out = !notified && withdraw(&self.waiters, &queued.waiter);

        (mutex.lock(), timed_out)
    }
}

/// Leaves the queue if the wait is cut short by an unwind
struct Queued<'a> {
    condvar: &'a Condvar,
    waiter: Arc<Waiter>,
    armed: bool,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.armed {
            withdraw(&self.condvar.waiters, &self.waiter);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::thread;

    #[test]
    fn test_notify_one() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let p = Arc::clone(&pair);
        let handle = thread::spawn(move || {
            let (lock, cv) = &*p;
            *lock.lock() = true;
            cv.notify_one();
        });

        let (lock, cv) = &*pair;
        let guard = cv.wait_while(lock.lock(), |ready| !*ready);
        assert!(*guard);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_notify_one_fifo() {
        let cv = Arc::new(Condvar::new());
        let lock = Arc::new(Mutex::new(0));
        let mut handles = Vec::new();
        for i in 0..3 {
            let (c, l) = (Arc::clone(&cv), Arc::clone(&lock));
            handles.push(thread::spawn(move || {
                let mut woken = c.wait(l.lock());
                *woken += 1;
                (i, *woken)
            }));
            while cv.waiters() != i + 1 {
                thread::yield_now();
            }
        }

        // One at a time, so each waiter sees how many went before it
        for (i, h) in handles.into_iter().enumerate() {
            cv.notify_one();
            assert_eq!(h.join().unwrap(), (i, i + 1));
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let lock = Mutex::new(());
        let cv = Condvar::new();
        let start = Instant::now();
        let (_guard, timed_out) = cv.wait_timeout(lock.lock(), Duration::from_millis(20));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(cv.waiters(), 0);
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        let state = Arc::new((Mutex::new(Vec::new()), Condvar::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let s = Arc::clone(&state);
            handles.push(thread::spawn(move || {
                let (lock, cv) = &*s;
                let mut order = cv.wait(lock.lock());
                order.push(i);
            }));
            while state.1.waiters() != i + 1 {
                thread::yield_now();
            }
        }

        let (lock, cv) = &*state;
        cv.notify_all();
        assert_eq!(cv.waiters(), 0);
        for h in handles {
            h.join().unwrap();
        }
        let mut order = lock.lock().clone();
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
