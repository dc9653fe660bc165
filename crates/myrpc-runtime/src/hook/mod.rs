//! # Syscall hook layer
//!
//! Blocking calls made inside a pool fiber park the fiber instead of the
//! worker thread:
//!
//! ```text
//!   read(fd) in fiber ──> add_io_event(fd, READ) ──> Fiber::block()
//!                                                       │
//!   worker: wait_event fires fd ──> resume ─────────────┘
//!                                       └──> real read(fd), hooks off
//! ```
//!
//! From the caller's side every function keeps POSIX conventions: the
//! real call's return value, `-1` with `errno` on failure. Timeout forms
//! return [`TIMEOUT`] with `errno = ETIMEDOUT` when the deadline fires
//! before the fd, without touching the fd.
//!
//! The fiber path is taken only when all of these hold: the thread-local
//! hook flag is on, the thread is a pool worker, the calling fiber is
//! the task that worker is running, and the thread is not unwinding.
//! Anything else, or an fd epoll cannot watch (`EPERM`, `EBADF`), falls
//! through to the real call.
//!
//! With the `interpose` feature the same logic is exported under the
//! libc names, so code that never heard of this crate is hooked too.

mod io;
pub mod raw;
mod sleep;
mod sys;

#[cfg(feature = "interpose")]
mod interpose;

pub use io::{
    accept, accept_timeout, close, connect, connect_timeout, read, read_timeout, readv, recv,
    recv_timeout, send, send_timeout, write, write_timeout, writev,
};
pub use sleep::{nanosleep, sleep, sleep_for, usleep};

use crate::event_manager::{Event, EventManager};
use crate::fiber::Fiber;
use crate::pool::worker::WorkerContext;
use crate::timer::TimerFd;
use crate::tls;
use myrpc_core::constants::TIMEOUT_SENTINEL;
use myrpc_core::{fatal, FiberId};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{trace, warn};

/// Returned by the `*_timeout` calls when the deadline wins
pub const TIMEOUT: i32 = TIMEOUT_SENTINEL;

/// Turns hooking off for its lifetime and restores the previous state.
///
/// The runtime wraps its own descriptor traffic in one of these so that
/// bookkeeping never re-enters the hook layer.
#[must_use = "hooking is restored when the guard drops"]
pub struct HookGuard {
    prev: bool,
}

impl HookGuard {
    pub fn disable() -> Self {
        Self {
            prev: tls::set_hook_enabled(false),
        }
    }

    pub fn enable() -> Self {
        Self {
            prev: tls::set_hook_enabled(true),
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        tls::set_hook_enabled(self.prev);
    }
}

/// Whether the hook flag is on for the calling thread or fiber
pub fn is_enabled() -> bool {
    tls::hook_enabled()
}

/// Set the hook flag for the calling fiber (or thread), returning the
/// previous value. Each fiber starts with hooking on.
pub fn set_enabled(on: bool) -> bool {
    tls::set_hook_enabled(on)
}

/// Whether a call made right now should take the fiber path
pub(crate) fn should_hook() -> bool {
    if !tls::hook_enabled() || std::thread::panicking() {
        return false;
    }
    let me = Fiber::current_id();
    me.is_some() && WorkerContext::with(|ctx| ctx.is_current(me)).unwrap_or(false)
}

/// Outcome of parking on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// The fd fired; the real call will not block
    Ready,
    /// The deadline fired first
    TimedOut,
    /// The fd cannot be watched; call through
    Bypass,
}

/// Withdraws whatever is still registered when the wait ends, including
/// when `term` unwinds the fiber out of `Fiber::block`.
struct Registration<'a> {
    events: &'a EventManager,
    fd: RawFd,
    event: Event,
    waiter: FiberId,
    timer: Option<RawFd>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.events.withdraw(self.fd, self.event, self.waiter);
        if let Some(timer) = self.timer {
            self.events.withdraw(timer, Event::READ, self.waiter);
        }
    }
}

/// Decide what a failed registration means for the caller.
///
/// `EPERM` (regular files and the like) and `EBADF` never block, and a
/// wake-up fd (`EEXIST`) is non-blocking, so those call through. Any
/// other `epoll_ctl` failure leaves the reactor unable to park fibers.
fn not_pollable(fd: RawFd, me: FiberId, err: Errno) -> Wait {
    match err {
        Errno::EPERM | Errno::EBADF | Errno::EEXIST => {
            trace!(fd = fd, fiber = %me, "fd not pollable ({}), calling through", err);
            Wait::Bypass
        }
        e => fatal!(fd = fd, fiber = %me, "epoll_ctl registration failed: {}", e),
    }
}

/// Whether `fd` is ready for `event` right now. ERR/HUP count as ready
/// since the real call then returns at once.
fn poll_ready(fd: RawFd, event: Event) -> bool {
    let mut events = 0;
    if event.contains(Event::READ) {
        events |= libc::POLLIN;
    }
    if event.contains(Event::WRITE) {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        match Errno::result(unsafe { libc::poll(&mut pfd, 1, 0) }) {
            Ok(n) => return n > 0,
            Err(Errno::EINTR) => continue,
            // The real call reports it
            Err(_) => return true,
        }
    }
}

/// Park the current fiber until `fd` is ready for `event`, or until
/// `timeout` elapses (`Duration::ZERO` waits forever).
///
/// Fibers on one worker may wait on the same fd; the reactor wakes them
/// one at a time. A woken fiber checks the fd is still ready before it
/// returns, and queues again if an earlier fiber drained it, so the real
/// call never blocks the worker.
///
/// Caller must have checked `should_hook`.
pub(crate) fn wait_fd(fd: RawFd, event: Event, timeout: Duration) -> Wait {
    let me = Fiber::current_id();
    WorkerContext::with(|ctx| {
        let events = &ctx.events;
        let _hooks = HookGuard::disable();

        if let Err(e) = events.add_io_event(fd, event, me) {
            return not_pollable(fd, me, e);
        }

        let timer = if timeout.is_zero() {
            None
        } else {
            match TimerFd::oneshot(timeout) {
                Ok(timer) => match events.add_io_event(timer.as_raw_fd(), Event::READ, me) {
                    Ok(()) => Some(timer),
                    Err(e) => {
                        warn!(fiber = %me, "timer registration failed ({}), waiting without deadline", e);
                        None
                    }
                },
                Err(e) => {
                    warn!(fiber = %me, "timerfd creation failed ({}), waiting without deadline", e);
                    None
                }
            }
        };
        let timer_fd = timer.as_ref().map(|t| t.as_raw_fd());
        let _registration = Registration {
            events,
            fd,
            event,
            waiter: me,
            timer: timer_fd,
        };

        // A waiter is dequeued when its direction fires, so no longer
        // being queued is the wake signal; anything else is spurious
        loop {
            if !events.is_waiting(fd, event, me) {
                if poll_ready(fd, event) {
                    return Wait::Ready;
                }
                trace!(fd = fd, fiber = %me, "fd drained before this fiber ran, waiting again");
                if let Err(e) = events.add_io_event(fd, event, me) {
                    return not_pollable(fd, me, e);
                }
            }
            if timer_fd.is_some_and(|t| !events.is_waiting(t, Event::READ, me)) {
                return Wait::TimedOut;
            }
            Fiber::block();
        }
    })
    .unwrap_or(Wait::Bypass)
}

/// Park the current fiber for `duration` on a one-shot timer.
/// Returns false if the timer could not be used.
pub(crate) fn wait_timer(duration: Duration) -> bool {
    let timer = {
        let _hooks = HookGuard::disable();
        match TimerFd::oneshot(duration) {
            Ok(timer) => timer,
            Err(e) => {
                warn!("timerfd creation failed ({}), sleeping the thread", e);
                return false;
            }
        }
    };

    let slept = wait_fd(timer.as_raw_fd(), Event::READ, Duration::ZERO) == Wait::Ready;
    let _hooks = HookGuard::disable();
    drop(timer);
    slept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_flag() {
        let before = is_enabled();
        {
            let _on = HookGuard::enable();
            assert!(is_enabled());
            {
                let _off = HookGuard::disable();
                assert!(!is_enabled());
            }
            assert!(is_enabled());
        }
        assert_eq!(is_enabled(), before);
    }

    #[test]
    fn test_plain_thread_never_hooks() {
        let _on = HookGuard::enable();
        assert!(!should_hook());
    }

    #[test]
    fn test_poll_ready_tracks_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        assert!(!poll_ready(rd, Event::READ));
        assert!(poll_ready(wr, Event::WRITE));
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);
        assert!(poll_ready(rd, Event::READ));

        let mut buf = [0u8; 1];
        assert_eq!(unsafe { libc::read(rd, buf.as_mut_ptr().cast(), 1) }, 1);
        assert!(!poll_ready(rd, Event::READ));

        // Hang-up counts as ready: the real read returns 0 at once
        unsafe { libc::close(wr) };
        assert!(poll_ready(rd, Event::READ));
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_unblockable_errors_call_through() {
        let me = FiberId::NONE;
        for err in [Errno::EPERM, Errno::EBADF, Errno::EEXIST] {
            assert_eq!(not_pollable(3, me, err), Wait::Bypass);
        }
    }

    #[test]
    fn test_standalone_fiber_never_hooks() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let enabled = Arc::new(AtomicBool::new(false));
        let hooked = Arc::new(AtomicBool::new(true));
        let (e, h) = (Arc::clone(&enabled), Arc::clone(&hooked));
        let fiber = Fiber::new(move || {
            e.store(is_enabled(), Ordering::SeqCst);
            h.store(should_hook(), Ordering::SeqCst);
        })
        .unwrap();

        fiber.resume();
        assert!(enabled.load(Ordering::SeqCst));
        assert!(!hooked.load(Ordering::SeqCst));
    }
}
