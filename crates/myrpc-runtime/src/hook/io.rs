//! Safe hooked I/O over slices
//!
//! Return values follow the syscalls: a byte count or descriptor, `-1`
//! with `errno` set, or [`TIMEOUT`](super::TIMEOUT) from the timeout forms.

use super::raw;
use libc::{c_int, sockaddr, socklen_t};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    read_timeout(fd, buf, Duration::ZERO)
}

pub fn read_timeout(fd: RawFd, buf: &mut [u8], timeout: Duration) -> isize {
    unsafe { raw::read_timeout(fd, buf.as_mut_ptr().cast(), buf.len(), timeout) }
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    write_timeout(fd, buf, Duration::ZERO)
}

pub fn write_timeout(fd: RawFd, buf: &[u8], timeout: Duration) -> isize {
    unsafe { raw::write_timeout(fd, buf.as_ptr().cast(), buf.len(), timeout) }
}

/// Scatter read; `IoSliceMut` is ABI-compatible with `iovec`
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> isize {
    let count = bufs.len().min(c_int::MAX as usize) as c_int;
    unsafe { raw::readv(fd, bufs.as_ptr().cast(), count) }
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> isize {
    let count = bufs.len().min(c_int::MAX as usize) as c_int;
    unsafe { raw::writev(fd, bufs.as_ptr().cast(), count) }
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> isize {
    recv_timeout(fd, buf, flags, Duration::ZERO)
}

pub fn recv_timeout(fd: RawFd, buf: &mut [u8], flags: c_int, timeout: Duration) -> isize {
    unsafe { raw::recv_timeout(fd, buf.as_mut_ptr().cast(), buf.len(), flags, timeout) }
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> isize {
    send_timeout(fd, buf, flags, Duration::ZERO)
}

pub fn send_timeout(fd: RawFd, buf: &[u8], flags: c_int, timeout: Duration) -> isize {
    unsafe { raw::send_timeout(fd, buf.as_ptr().cast(), buf.len(), flags, timeout) }
}

/// Accept a connection, optionally filling in the peer address
pub fn accept(fd: RawFd, peer: Option<&mut libc::sockaddr_storage>) -> RawFd {
    accept_timeout(fd, peer, Duration::ZERO)
}

pub fn accept_timeout(
    fd: RawFd,
    peer: Option<&mut libc::sockaddr_storage>,
    timeout: Duration,
) -> RawFd {
    match peer {
        Some(storage) => {
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            let addr = (storage as *mut libc::sockaddr_storage).cast::<sockaddr>();
            unsafe { raw::accept_timeout(fd, addr, &mut len, timeout) }
        }
        None => unsafe {
            raw::accept_timeout(fd, std::ptr::null_mut(), std::ptr::null_mut(), timeout)
        },
    }
}

pub fn connect(fd: RawFd, addr: &SocketAddr) -> c_int {
    connect_timeout(fd, addr, Duration::ZERO)
}

pub fn connect_timeout(fd: RawFd, addr: &SocketAddr, timeout: Duration) -> c_int {
    let storage = SockaddrStorage::from(*addr);
    unsafe { raw::connect_timeout(fd, storage.as_ptr(), storage.len(), timeout) }
}

/// Close `fd`, dropping reactor interest in it first
pub fn close(fd: RawFd) -> c_int {
    unsafe { raw::close(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_passthrough_outside_fiber() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(read(a.as_raw_fd(), &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");

        assert_eq!(write(a.as_raw_fd(), b"pong"), 4);
        assert_eq!(recv(b.as_raw_fd(), &mut buf, 0), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn test_vectored_passthrough() {
        let (a, b) = UnixStream::pair().unwrap();
        let parts = [IoSlice::new(b"ab"), IoSlice::new(b"cde")];
        assert_eq!(writev(a.as_raw_fd(), &parts), 5);

        let (mut x, mut y) = ([0u8; 2], [0u8; 3]);
        let mut bufs = [IoSliceMut::new(&mut x), IoSliceMut::new(&mut y)];
        assert_eq!(readv(b.as_raw_fd(), &mut bufs), 5);
        assert_eq!(&x, b"ab");
        assert_eq!(&y, b"cde");
    }

    #[test]
    fn test_close_reports_ebadf() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.into_raw_fd();
        assert_eq!(close(fd), 0);
        assert_eq!(close(fd), -1);
        assert_eq!(nix::errno::Errno::last(), nix::errno::Errno::EBADF);
    }
}
