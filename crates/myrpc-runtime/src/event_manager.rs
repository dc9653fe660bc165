//! Per-worker epoll reactor
//!
//! Each pool worker owns one `EventManager`. Fibers register interest in
//! a descriptor, block, and are handed back to the scheduler when the
//! descriptor fires:
//!
//! ```text
//!   fiber: add_io_event(fd, READ, me) -> block()
//!   worker: wait_event() -> epoll_wait -> on_ready(me) -> resume
//! ```
//!
//! Read and write interest on one fd are tracked independently and may
//! belong to different fibers. Several fibers may wait on the same
//! direction; they queue FIFO and each firing hands the direction to the
//! head only. The fd is then re-armed for whatever is left, or deleted.
//!
//! Wake-up eventfds (the manager's own, plus any added with
//! `add_wakeup_eventfd`) only interrupt `epoll_wait`. They are drained
//! and never reported to the callback.
//!
//! Not `Sync`: the manager is only touched from its worker thread.

use crate::notifier::EventFd;
use myrpc_core::{fatal, FiberId};
use nix::errno::Errno;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Readiness direction(s) a fiber waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

/// Waiters registered on one fd, queued FIFO per direction
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Interest {
    read: VecDeque<FiberId>,
    write: VecDeque<FiberId>,
}

impl Interest {
    fn mask(&self) -> u32 {
        let mut mask = 0;
        if !self.read.is_empty() {
            mask |= Event::READ.bits();
        }
        if !self.write.is_empty() {
            mask |= Event::WRITE.bits();
        }
        mask
    }

    fn queues_mut(&mut self, event: Event) -> impl Iterator<Item = &mut VecDeque<FiberId>> + '_ {
        let read = event.contains(Event::READ).then_some(&mut self.read);
        let write = event.contains(Event::WRITE).then_some(&mut self.write);
        read.into_iter().chain(write)
    }
}

#[derive(Default)]
struct Registry {
    fds: HashMap<RawFd, Interest>,
    wakeups: HashSet<RawFd>,
}

pub struct EventManager {
    epoll: OwnedFd,
    waker: Arc<EventFd>,
    registry: RefCell<Registry>,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl EventManager {
    /// Create a reactor with its own wake-up eventfd
    pub fn new(max_events: usize) -> nix::Result<Self> {
        Self::with_waker(max_events, Arc::new(EventFd::new()?))
    }

    /// Create a reactor woken through `waker`; the pool keeps a clone so
    /// other threads can interrupt this worker's `epoll_wait`.
    pub fn with_waker(max_events: usize, waker: Arc<EventFd>) -> nix::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        let fd = Errno::result(fd)?;
        let manager = Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            waker,
            registry: RefCell::new(Registry::default()),
            events: RefCell::new(vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
        };
        manager.add_wakeup_eventfd(manager.waker.as_raw_fd())?;
        Ok(manager)
    }

    /// Queue `waiter` for `event` on `fd`, behind any fibers already
    /// waiting in that direction. Registering twice is a no-op.
    ///
    /// Fails with `EEXIST` when `fd` is a wake-up fd, and with the
    /// `epoll_ctl` errno when the fd cannot be polled, e.g. `EPERM` for
    /// regular files.
    pub fn add_io_event(&self, fd: RawFd, event: Event, waiter: FiberId) -> nix::Result<()> {
        let mut reg = self.registry.borrow_mut();
        if reg.wakeups.contains(&fd) {
            return Err(Errno::EEXIST);
        }

        let (registered, old_mask, mut interest) = match reg.fds.get(&fd) {
            Some(interest) => (true, interest.mask(), interest.clone()),
            None => (false, 0, Interest::default()),
        };
        for queue in interest.queues_mut(event) {
            if !queue.contains(&waiter) {
                queue.push_back(waiter);
            }
        }

        let mask = interest.mask();
        if registered && mask != old_mask {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, mask) {
                // The kernel dropped the old registration when the fd was closed
                Err(Errno::ENOENT) => self.ctl(libc::EPOLL_CTL_ADD, fd, mask)?,
                other => other?,
            }
        } else if !registered {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, mask) {
                Err(Errno::EEXIST) => self.ctl(libc::EPOLL_CTL_MOD, fd, mask)?,
                other => other?,
            }
        }
        reg.fds.insert(fd, interest);
        Ok(())
    }

    /// Drop every waiter for `event` on `fd`. Returns whether anything
    /// was registered for it.
    pub fn remove_io_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove_where(fd, event, |_| true)
    }

    /// Take `waiter` out of the `event` queues on `fd`, leaving other
    /// waiters registered. Returns whether it was queued.
    pub fn withdraw(&self, fd: RawFd, event: Event, waiter: FiberId) -> bool {
        self.remove_where(fd, event, |id| id == waiter)
    }

    fn remove_where(&self, fd: RawFd, event: Event, matches: impl Fn(FiberId) -> bool) -> bool {
        let mut reg = self.registry.borrow_mut();
        let Some(interest) = reg.fds.get_mut(&fd) else {
            return false;
        };

        let before = interest.mask();
        let mut removed = false;
        for queue in interest.queues_mut(event) {
            let len = queue.len();
            queue.retain(|&id| !matches(id));
            removed |= queue.len() != len;
        }
        if !removed {
            return false;
        }

        let mask = interest.mask();
        if mask == 0 {
            reg.fds.remove(&fd);
        }
        if mask != before {
            self.rearm(fd, mask);
        }
        true
    }

    /// Whether any direction in `event` is registered on `fd`
    pub fn is_exist_io_event(&self, fd: RawFd, event: Event) -> bool {
        let reg = self.registry.borrow();
        reg.fds.get(&fd).is_some_and(|interest| interest.mask() & event.bits() != 0)
    }

    /// Whether `waiter` is still queued for any direction in `event`
    pub fn is_waiting(&self, fd: RawFd, event: Event, waiter: FiberId) -> bool {
        let reg = self.registry.borrow();
        reg.fds.get(&fd).is_some_and(|interest| {
            (event.contains(Event::READ) && interest.read.contains(&waiter))
                || (event.contains(Event::WRITE) && interest.write.contains(&waiter))
        })
    }

    /// Forget every registration on `fd`; called before the fd is closed
    pub fn remove_fd(&self, fd: RawFd) {
        let removed = self.registry.borrow_mut().fds.remove(&fd);
        if removed.is_some() {
            self.rearm(fd, 0);
        }
    }

    /// Register a drain-only eventfd. It is switched to non-blocking mode
    /// and never reported as application readiness.
    pub fn add_wakeup_eventfd(&self, fd: RawFd) -> nix::Result<()> {
        let mut reg = self.registry.borrow_mut();
        if reg.wakeups.contains(&fd) {
            return Ok(());
        }

        let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        if flags & libc::O_NONBLOCK == 0 {
            Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
        }

        self.ctl(libc::EPOLL_CTL_ADD, fd, Event::READ.bits())?;
        reg.wakeups.insert(fd);
        Ok(())
    }

    /// Interrupt a concurrent or upcoming `wait_event`. Callable from any
    /// thread holding the notifier.
    pub fn notify(&self) {
        if let Err(e) = self.waker.notify() {
            fatal!("event manager wake-up write failed: {}", e);
        }
    }

    /// Shared handle to this manager's wake-up eventfd
    pub fn notifier(&self) -> Arc<EventFd> {
        Arc::clone(&self.waker)
    }

    /// Number of fds with application interest
    pub fn registered(&self) -> usize {
        self.registry.borrow().fds.len()
    }

    /// Wait up to `timeout` for readiness and report each woken waiter.
    ///
    /// ERR/HUP count as both read and write readiness. Fired directions
    /// are deregistered before `on_ready` runs, and `on_ready` is called
    /// outside any internal borrow so it may resume fibers that register
    /// new events. A waiter fired on several fds in one batch is reported
    /// once. Returns the number of waiters reported.
    pub fn wait_event(&self, timeout: Duration, mut on_ready: impl FnMut(FiberId)) -> usize {
        let fired = {
            let mut events = self.events.borrow_mut();
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms(timeout),
                )
            };
            let n = match Errno::result(n) {
                Ok(n) => n as usize,
                Err(Errno::EINTR) => return 0,
                Err(e) => fatal!("epoll_wait failed: {}", e),
            };

            let mut reg = self.registry.borrow_mut();
            let mut fired: Vec<FiberId> = Vec::with_capacity(n);
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let happened = ev.events;

                if reg.wakeups.contains(&fd) {
                    EventFd::drain_fd(fd);
                    continue;
                }
                // Removed after epoll_wait queued it
                let Some(interest) = reg.fds.get_mut(&fd) else {
                    continue;
                };

                let mut ready = happened & (Event::READ.bits() | Event::WRITE.bits());
                if happened & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    ready |= Event::READ.bits() | Event::WRITE.bits();
                }

                // One waiter per fired direction; the rest stay queued and
                // the re-arm reports the fd again while it is still ready
                let mut woke = Vec::with_capacity(2);
                if ready & Event::READ.bits() != 0 {
                    woke.extend(interest.read.pop_front());
                }
                if ready & Event::WRITE.bits() != 0 {
                    woke.extend(interest.write.pop_front());
                }
                if woke.is_empty() {
                    continue;
                }

                let mask = interest.mask();
                if mask == 0 {
                    reg.fds.remove(&fd);
                }
                self.rearm(fd, mask);

                for waiter in woke {
                    if !fired.contains(&waiter) {
                        fired.push(waiter);
                    }
                }
            }
            fired
        };

        trace!(woken = fired.len(), "wait_event");
        let count = fired.len();
        for waiter in fired {
            on_ready(waiter);
        }
        count
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> nix::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        Errno::result(ret).map(drop)
    }

    /// Re-arm `fd` for `mask`, deleting it when empty. The fd may already
    /// be closed by the fiber that just ran; anything else is fatal.
    fn rearm(&self, fd: RawFd, mask: u32) {
        let op = if mask == 0 { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        match self.ctl(op, fd, mask) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(e) => fatal!(fd = fd, "epoll_ctl re-arm failed: {}", e),
        }
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("registered", &self.registered())
            .finish()
    }
}

/// Millisecond timeout for epoll_wait, rounding sub-millisecond waits up
fn timeout_ms(timeout: Duration) -> i32 {
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    if ms == 0 && !timeout.is_zero() {
        1
    } else {
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn collect(em: &EventManager, timeout: Duration) -> Vec<FiberId> {
        let mut out = Vec::new();
        em.wait_event(timeout, |id| out.push(id));
        out
    }

    #[test]
    fn test_read_fires_and_deregisters() {
        let em = EventManager::new(16).unwrap();
        let (rd, wr) = pipe();
        let waiter = FiberId::from_raw(7);

        em.add_io_event(rd.as_raw_fd(), Event::READ, waiter).unwrap();
        assert!(em.is_exist_io_event(rd.as_raw_fd(), Event::READ));
        assert!(collect(&em, Duration::from_millis(10)).is_empty());

        let ret = unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(ret, 1);
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![waiter]);
        assert!(!em.is_exist_io_event(rd.as_raw_fd(), Event::READ));
        assert_eq!(em.registered(), 0);
    }

    #[test]
    fn test_directions_are_independent() {
        let em = EventManager::new(16).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let (reader, writer) = (FiberId::from_raw(1), FiberId::from_raw(2));

        em.add_io_event(a.as_raw_fd(), Event::READ, reader).unwrap();
        em.add_io_event(a.as_raw_fd(), Event::WRITE, writer).unwrap();

        // Writable right away; read interest must survive the re-arm
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![writer]);
        assert!(em.is_exist_io_event(a.as_raw_fd(), Event::READ));
        assert!(!em.is_exist_io_event(a.as_raw_fd(), Event::WRITE));

        b.write_all(b"ping").unwrap();
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![reader]);
        assert_eq!(em.registered(), 0);
    }

    #[test]
    fn test_same_direction_waiters_queue_fifo() {
        let em = EventManager::new(16).unwrap();
        let (rd, wr) = pipe();
        let fd = rd.as_raw_fd();
        let (first, second) = (FiberId::from_raw(1), FiberId::from_raw(2));

        em.add_io_event(fd, Event::READ, first).unwrap();
        em.add_io_event(fd, Event::READ, second).unwrap();
        em.add_io_event(fd, Event::READ, first).unwrap();
        assert!(em.is_waiting(fd, Event::READ, first));
        assert!(em.is_waiting(fd, Event::READ, second));

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![first]);
        assert!(!em.is_waiting(fd, Event::READ, first));
        assert!(em.is_waiting(fd, Event::READ, second));

        // Still readable, so the re-arm reports it for the next in line
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![second]);
        assert_eq!(em.registered(), 0);
    }

    #[test]
    fn test_withdraw_leaves_other_waiters() {
        let em = EventManager::new(16).unwrap();
        let (rd, wr) = pipe();
        let fd = rd.as_raw_fd();
        let (first, second) = (FiberId::from_raw(1), FiberId::from_raw(2));

        em.add_io_event(fd, Event::READ, first).unwrap();
        em.add_io_event(fd, Event::READ, second).unwrap();
        assert!(em.withdraw(fd, Event::READ, first));
        assert!(!em.withdraw(fd, Event::READ, first));
        assert!(em.is_exist_io_event(fd, Event::READ));

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![second]);
    }

    #[test]
    fn test_regular_file_not_pollable() {
        let em = EventManager::new(16).unwrap();
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        assert_eq!(
            em.add_io_event(file.as_raw_fd(), Event::READ, FiberId::from_raw(1)),
            Err(Errno::EPERM)
        );
        assert_eq!(em.registered(), 0);
    }

    #[test]
    fn test_remove_io_event() {
        let em = EventManager::new(16).unwrap();
        let (rd, wr) = pipe();
        let fd = rd.as_raw_fd();

        em.add_io_event(fd, Event::READ, FiberId::from_raw(3)).unwrap();
        assert!(em.remove_io_event(fd, Event::READ));
        assert!(!em.remove_io_event(fd, Event::READ));

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr().cast(), 1) };
        assert!(collect(&em, Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn test_hangup_wakes_reader() {
        let em = EventManager::new(16).unwrap();
        let (rd, wr) = pipe();
        let waiter = FiberId::from_raw(9);

        em.add_io_event(rd.as_raw_fd(), Event::READ, waiter).unwrap();
        drop(wr);
        assert_eq!(collect(&em, Duration::from_secs(1)), vec![waiter]);
    }

    #[test]
    fn test_notify_interrupts_wait() {
        let em = EventManager::new(16).unwrap();
        let notifier = em.notifier();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify().unwrap();
        });

        let start = Instant::now();
        assert!(collect(&em, Duration::from_secs(5)).is_empty());
        assert!(start.elapsed() < Duration::from_secs(4));
        handle.join().unwrap();
    }

    #[test]
    fn test_wakeup_fd_is_not_application_io() {
        let em = EventManager::new(16).unwrap();
        let extra = EventFd::new().unwrap();
        em.add_wakeup_eventfd(extra.as_raw_fd()).unwrap();
        assert_eq!(
            em.add_io_event(extra.as_raw_fd(), Event::READ, FiberId::from_raw(1)),
            Err(Errno::EEXIST)
        );

        extra.notify().unwrap();
        assert!(collect(&em, Duration::from_secs(1)).is_empty());
        assert_eq!(extra.drain(), 0);
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_micros(10)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(250)), 250);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
