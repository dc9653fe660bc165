//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended `lock` parks the calling fiber
//! and lets its worker run other fibers. Plain threads may use it too;
//! they park the OS thread.
//!
//! Waiters are served strictly in arrival order. `unlock` hands the lock
//! straight to the queue head without clearing the flag, so a barging
//! `try_lock` can never overtake a queued waiter.

use super::waiter::{withdraw, WaitQueue, Waiter};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use myrpc_core::SpinLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Acquire attempts before a contended `lock` queues up
const SPIN_LIMIT: u32 = 64;

/// Data-less lock with explicit `lock`/`unlock`
pub struct RawMutex {
    locked: AtomicBool,
    waiters: WaitQueue,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the lock, parking the caller while it is contended
    pub fn lock(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_lock() {
                return;
            }
            core::hint::spin_loop();
        }
        self.lock_slow(None);
    }

    /// Like `lock`, but gives up after `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.try_lock() || self.lock_slow(Some(Instant::now() + timeout))
    }

    /// Release the lock, handing it to the longest waiter if any.
    ///
    /// # Safety
    ///
    /// The lock must be held. It need not have been taken by the caller,
    /// which is how a reader-writer lock releases on behalf of a group.
    pub unsafe fn unlock(&self) {
        let next = {
            let mut waiters = self.waiters.lock();
            let next = waiters.pop_front();
            if next.is_none() {
                self.locked.store(false, Ordering::Release);
            }
            next
        };
        // Ownership passes with the pop; the flag stays set
        if let Some(waiter) = next {
            waiter.grant();
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Number of queued waiters right now
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn lock_slow(&self, deadline: Option<Instant>) -> bool {
        let waiter = Waiter::new();
        {
            let mut waiters = self.waiters.lock();
            // Under the queue lock so an unlock cannot slip between the
            // failed attempt and the push
            if self.try_lock() {
                return true;
            }
            waiters.push_back(Arc::clone(&waiter));
        }

        let mut queued = Queued {
            mutex: self,
            waiter,
            armed: true,
        };
        if queued.waiter.wait_until(deadline) {
            queued.armed = false;
            debug_assert!(self.is_locked());
            return true;
        }

        // Timed out; a grant racing with the deadline still wins
        queued.armed = false;
        !withdraw(&self.waiters, &queued.waiter)
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("locked", &self.is_locked())
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// Leaves the queue if the wait is cut short by an unwind. If the lock
/// was already handed over it is passed on to the next waiter.
struct Queued<'a> {
    mutex: &'a RawMutex,
    waiter: Arc<Waiter>,
    armed: bool,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.armed && !withdraw(&self.mutex.waiters, &self.waiter) {
            unsafe { self.mutex.unlock() };
        }
    }
}

/// A mutual-exclusion lock protecting a `T`
///
/// # Example
///
/// ```ignore
/// let counter = Arc::new(Mutex::new(0));
///
/// // In a fiber:
/// *counter.lock() += 1;
/// ```
pub struct Mutex<T: ?Sized> {
    pub(super) raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: the raw lock serializes all access to `data`
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock().then(|| MutexGuard { mutex: self })
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.raw
            .try_lock_for(timeout)
            .then(|| MutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Exclusive access through `&mut self` needs no locking
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Releases the mutex when dropped
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized> {
    pub(super) mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
