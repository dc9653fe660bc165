//! Fiber-aware reader-writer lock
//!
//! Built from two `RawMutex`es. `write_lock` is held while a writer or
//! at least one reader is inside: the first reader in takes it for the
//! whole group and the last reader out releases it. `read_lock` guards
//! the reader count.
//!
//! Once a writer is waiting, arriving readers queue on `write_lock`
//! behind it instead of joining the current group, so a steady stream
//! of readers cannot starve writers.

use super::mutex::RawMutex;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::fmt;

pub struct RwLock<T: ?Sized> {
    write_lock: RawMutex,
    read_lock: RawMutex,
    /// Guarded by `read_lock`
    readers: AtomicUsize,
    /// Writers queued on `write_lock`; readers block while non-zero
    reader_blocked: AtomicUsize,
    data: UnsafeCell<T>,
}

// Safety: writers are exclusive, readers only get `&T`
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            write_lock: RawMutex::new(),
            read_lock: RawMutex::new(),
            readers: AtomicUsize::new(0),
            reader_blocked: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Shared access, parking while a writer holds or waits for the lock
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        if self.reader_blocked.load(Ordering::Acquire) > 0 {
            // Let the queued writer go first
            self.write_lock.lock();
            unsafe { self.write_lock.unlock() };
        }

        self.read_lock.lock();
        if self.readers.load(Ordering::Relaxed) == 0 {
            self.write_lock.lock();
        }
        self.readers.fetch_add(1, Ordering::Relaxed);
        unsafe { self.read_lock.unlock() };

        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.reader_blocked.load(Ordering::Acquire) > 0 || !self.read_lock.try_lock() {
            return None;
        }
        let entered = self.readers.load(Ordering::Relaxed) > 0 || self.write_lock.try_lock();
        if entered {
            self.readers.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { self.read_lock.unlock() };
        entered.then(|| RwLockReadGuard { lock: self })
    }

    /// Exclusive access
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        if !self.write_lock.try_lock() {
            self.reader_blocked.fetch_add(1, Ordering::AcqRel);
            let _unblock = Unblock(&self.reader_blocked);
            self.write_lock.lock();
        }
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.write_lock
            .try_lock()
            .then(|| RwLockWriteGuard { lock: self })
    }

    /// Readers inside right now
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock_shared(&self) {
        self.read_lock.lock();
        if self.readers.fetch_sub(1, Ordering::Relaxed) == 1 {
            // Last reader out releases for the group
            unsafe { self.write_lock.unlock() };
        }
        unsafe { self.read_lock.unlock() };
    }
}

/// Drops a writer's claim on `reader_blocked`, also on unwind
struct Unblock<'a>(&'a AtomicUsize);

impl Drop for Unblock<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("RwLock").field("data", &&*guard).finish(),
            None => f.debug_struct("RwLock").field("data", &"<locked>").finish(),
        }
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.write_lock.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let lock = RwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_write().is_none());

        drop(a);
        drop(b);
        assert_eq!(lock.readers(), 0);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = RwLock::new(0);
        let mut w = lock.write();
        *w = 1;
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);
        assert_eq!(*lock.try_read().unwrap(), 1);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new(0));
        let reader = lock.read();

        let l = Arc::clone(&lock);
        let writer = thread::spawn(move || *l.write() += 1);
        while lock.reader_blocked.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        assert!(lock.try_read().is_none());

        drop(reader);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 1);
        assert_eq!(lock.reader_blocked.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_no_torn_reads() {
        let lock = Arc::new(RwLock::new((0u64, 0u64)));
        let mut handles = Vec::new();

        for _ in 0..2 {
            let l = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let mut w = l.write();
                    w.0 = i;
                    thread::sleep(Duration::from_micros(10));
                    w.1 = i;
                }
            }));
        }
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let r = l.read();
                    assert_eq!(r.0, r.1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
