//! POSIX-shaped hooked calls
//!
//! Same arguments and return conventions as the libc functions they
//! shadow, plus `_timeout` forms taking a `Duration` (`ZERO` waits
//! forever). The safe wrappers in `hook` and the `interpose` exports are
//! both built on these.
//!
//! # Safety
//!
//! Every function here has the pointer contract of its libc namesake.

use super::sys::{self, errno, set_errno};
use super::{should_hook, wait_fd, HookGuard, Wait, TIMEOUT};
use crate::event_manager::Event;
use crate::pool::worker::WorkerContext;
use libc::{c_int, c_void, iovec, size_t, sockaddr, socklen_t, ssize_t};
use std::os::fd::RawFd;
use std::time::Duration;

/// Return types that can carry [`TIMEOUT`]
trait Timeout {
    const TIMEOUT: Self;
}

impl Timeout for c_int {
    const TIMEOUT: c_int = TIMEOUT;
}

impl Timeout for ssize_t {
    const TIMEOUT: ssize_t = TIMEOUT as ssize_t;
}

/// Wait for `event` on `fd`, then make the real call with hooks off
#[inline]
fn hooked<R: Timeout>(fd: RawFd, event: Event, timeout: Duration, call: impl FnOnce() -> R) -> R {
    if !should_hook() {
        return call();
    }
    match wait_fd(fd, event, timeout) {
        Wait::TimedOut => {
            set_errno(libc::ETIMEDOUT);
            R::TIMEOUT
        }
        Wait::Ready | Wait::Bypass => {
            let _hooks = HookGuard::disable();
            call()
        }
    }
}

pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    read_timeout(fd, buf, count, Duration::ZERO)
}

pub unsafe fn read_timeout(fd: c_int, buf: *mut c_void, count: size_t, timeout: Duration) -> ssize_t {
    hooked(fd, Event::READ, timeout, || sys::read(fd, buf, count))
}

pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    write_timeout(fd, buf, count, Duration::ZERO)
}

pub unsafe fn write_timeout(fd: c_int, buf: *const c_void, count: size_t, timeout: Duration) -> ssize_t {
    hooked(fd, Event::WRITE, timeout, || sys::write(fd, buf, count))
}

pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    hooked(fd, Event::READ, Duration::ZERO, || sys::readv(fd, iov, iovcnt))
}

pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    hooked(fd, Event::WRITE, Duration::ZERO, || sys::writev(fd, iov, iovcnt))
}

pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    recv_timeout(fd, buf, len, flags, Duration::ZERO)
}

pub unsafe fn recv_timeout(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    timeout: Duration,
) -> ssize_t {
    hooked(fd, Event::READ, timeout, || sys::recv(fd, buf, len, flags))
}

pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    send_timeout(fd, buf, len, flags, Duration::ZERO)
}

pub unsafe fn send_timeout(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    timeout: Duration,
) -> ssize_t {
    hooked(fd, Event::WRITE, timeout, || sys::send(fd, buf, len, flags))
}

pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    accept_timeout(fd, addr, len, Duration::ZERO)
}

pub unsafe fn accept_timeout(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    timeout: Duration,
) -> c_int {
    hooked(fd, Event::READ, timeout, || sys::accept(fd, addr, len))
}

pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_timeout(fd, addr, len, Duration::ZERO)
}

/// Connect without blocking the worker.
///
/// A blocking socket is switched to non-blocking for the handshake and
/// restored afterwards; a socket that is already non-blocking is left to
/// the caller, exactly as the real call would.
pub unsafe fn connect_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout: Duration,
) -> c_int {
    if !should_hook() {
        return sys::connect(fd, addr, len);
    }

    let _hooks = HookGuard::disable();
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags < 0 {
        return -1;
    }
    if flags & libc::O_NONBLOCK != 0 {
        return sys::connect(fd, addr, len);
    }
    if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
        return -1;
    }

    let ret = match sys::connect(fd, addr, len) {
        0 => 0,
        _ if errno() != libc::EINPROGRESS => -1,
        _ => match wait_fd(fd, Event::WRITE, timeout) {
            Wait::Ready => socket_error(fd),
            Wait::TimedOut => {
                set_errno(libc::ETIMEDOUT);
                TIMEOUT
            }
            Wait::Bypass => {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                if libc::poll(&mut pfd, 1, -1) < 0 {
                    -1
                } else {
                    socket_error(fd)
                }
            }
        },
    };

    let saved = errno();
    libc::fcntl(fd, libc::F_SETFL, flags);
    set_errno(saved);
    ret
}

/// Outcome of a finished non-blocking connect
unsafe fn socket_error(fd: c_int) -> c_int {
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let ret = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&mut err as *mut c_int).cast(),
        &mut len,
    );
    if ret < 0 {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

/// Close `fd`, first dropping any interest this worker's reactor holds
/// for it so a reused descriptor number starts clean.
pub unsafe fn close(fd: c_int) -> c_int {
    let _hooks = HookGuard::disable();
    WorkerContext::with(|ctx| ctx.events.remove_fd(fd));
    sys::close(fd)
}

pub unsafe fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    super::sleep::sleep(seconds)
}

pub unsafe fn usleep(usec: libc::useconds_t) -> c_int {
    super::sleep::usleep(usec)
}

pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    super::sleep::nanosleep_raw(req, rem)
}
