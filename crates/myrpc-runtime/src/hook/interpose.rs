//! libc-named exports
//!
//! Linked into a binary, these shadow the C library's definitions so
//! unmodified callers go through the hook layer. The real functions are
//! reached through `sys`.

use super::raw;
use libc::{c_int, c_uint, c_void, iovec, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    raw::read(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    raw::write(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    raw::readv(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    raw::writev(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    raw::recv(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    raw::send(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    raw::accept(fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    raw::connect(fd, addr, len)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    raw::close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    raw::sleep(seconds)
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    raw::usleep(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    raw::nanosleep(req, rem)
}
