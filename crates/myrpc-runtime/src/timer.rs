//! One-shot timerfd used by the hooked sleep calls
//!
//! The fd becomes readable once the timer expires, so a sleeping fiber
//! can park on it through the event manager like any other descriptor.

use crate::hook::HookGuard;
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    /// Arm a CLOCK_MONOTONIC timer that fires once after `after`.
    ///
    /// A zero duration is armed as one nanosecond; an all-zero
    /// itimerspec would disarm the timer instead.
    pub fn oneshot(after: Duration) -> nix::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        let fd = Errno::result(fd)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let after = if after.is_zero() { Duration::from_nanos(1) } else { after };
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = after.as_secs().min(libc::time_t::MAX as u64) as libc::time_t;
        spec.it_value.tv_nsec = after.subsec_nanos() as libc::c_long;

        let ret = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        Errno::result(ret)?;
        Ok(Self { fd })
    }

    /// Whether the timer has fired; consumes the expiration count
    pub fn expired(&self) -> bool {
        let mut ticks: u64 = 0;
        let _hooks = HookGuard::disable();
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut ticks as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize && ticks > 0
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_oneshot_fires() {
        let timer = TimerFd::oneshot(Duration::from_millis(10)).unwrap();
        assert!(!timer.expired());

        let start = Instant::now();
        while !timer.expired() {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_zero_duration_still_fires() {
        let timer = TimerFd::oneshot(Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.expired());
    }
}
