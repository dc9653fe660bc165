//! Hooked sleeps
//!
//! Inside a pool fiber the fiber parks on a one-shot timerfd and the
//! worker keeps running others. Elsewhere the thread sleeps as usual.
//! A fiber sleep always runs to completion, so the "time remaining"
//! results are zero.

use super::sys::{self, set_errno};
use super::{should_hook, wait_timer};
use libc::{c_int, c_uint, timespec, useconds_t};
use std::time::Duration;

pub fn sleep(seconds: c_uint) -> c_uint {
    if should_hook() && wait_timer(Duration::from_secs(seconds.into())) {
        return 0;
    }
    unsafe { sys::sleep(seconds) }
}

pub fn usleep(usec: useconds_t) -> c_int {
    if should_hook() && wait_timer(Duration::from_micros(usec.into())) {
        return 0;
    }
    unsafe { sys::usleep(usec) }
}

/// `nanosleep(2)` with references in place of pointers
pub fn nanosleep(req: &timespec, rem: Option<&mut timespec>) -> c_int {
    let rem = rem.map_or(std::ptr::null_mut(), |r| r as *mut timespec);
    unsafe { nanosleep_raw(req, rem) }
}

/// # Safety
///
/// `req` must be valid for reads; `rem` null or valid for writes.
pub(crate) unsafe fn nanosleep_raw(req: *const timespec, rem: *mut timespec) -> c_int {
    if !should_hook() || req.is_null() {
        return sys::nanosleep(req, rem);
    }

    let req_ref = &*req;
    if req_ref.tv_sec < 0 || !(0..1_000_000_000).contains(&req_ref.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    let duration = Duration::new(req_ref.tv_sec as u64, req_ref.tv_nsec as u32);
    if !wait_timer(duration) {
        return sys::nanosleep(req, rem);
    }
    if !rem.is_null() {
        (*rem).tv_sec = 0;
        (*rem).tv_nsec = 0;
    }
    0
}

/// Sleep for `duration`, yielding the worker when called in a pool fiber
pub fn sleep_for(duration: Duration) {
    if should_hook() && wait_timer(duration) {
        return;
    }
    std::thread::sleep(duration);
}
