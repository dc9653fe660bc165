//! eventfd wake-up channel
//!
//! Writes add to the eventfd counter, so several `notify()` calls before
//! the reader drains it collapse into a single wake-up.

use crate::hook::HookGuard;
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a nonblocking, close-on-exec eventfd
    pub fn new() -> nix::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        let fd = Errno::result(fd)?;
        // Safety: freshly created descriptor owned by nobody else
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Bump the counter, waking whoever polls the fd
    pub fn notify(&self) -> nix::Result<()> {
        let val: u64 = 1;
        let _hooks = HookGuard::disable();
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(()),
            // Counter saturated: a wake-up is already pending
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reset the counter to zero, returning how many notifies were pending
    pub fn drain(&self) -> u64 {
        Self::drain_fd(self.fd.as_raw_fd())
    }

    /// Drain any nonblocking eventfd by descriptor
    pub fn drain_fd(fd: RawFd) -> u64 {
        let mut val: u64 = 0;
        let _hooks = HookGuard::disable();
        let ret = unsafe {
            libc::read(
                fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret == std::mem::size_of::<u64>() as isize {
            val
        } else {
            0
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventFd").field(&self.fd.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifies_coalesce() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.drain(), 0);

        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_is_nonblocking_and_cloexec() {
        let efd = EventFd::new().unwrap();
        let fl = unsafe { libc::fcntl(efd.as_raw_fd(), libc::F_GETFL) };
        let fd_fl = unsafe { libc::fcntl(efd.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(fl & libc::O_NONBLOCK, 0);
        assert_ne!(fd_fl & libc::FD_CLOEXEC, 0);
    }
}
