//! Real entry points behind the hooks
//!
//! Without `interpose` these are plain libc calls. With it, the libc
//! names in this binary resolve to the hook exports, so the next
//! definition in link order is looked up once with `dlsym(RTLD_NEXT)`.

use libc::{c_int, c_uint, c_void, iovec, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

macro_rules! real_calls {
    ($( fn $name:ident( $($arg:ident: $ty:ty),* ) -> $ret:ty; )*) => {
        $(
            #[cfg(not(feature = "interpose"))]
            #[inline]
            pub(crate) unsafe fn $name($($arg: $ty),*) -> $ret {
                libc::$name($($arg),*)
            }

            #[cfg(feature = "interpose")]
            pub(crate) unsafe fn $name($($arg: $ty),*) -> $ret {
                type Real = unsafe extern "C" fn($($ty),*) -> $ret;
                static REAL: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
                let addr = *REAL.get_or_init(|| resolve(concat!(stringify!($name), "\0")));
                let real = std::mem::transmute::<usize, Real>(addr);
                real($($arg),*)
            }
        )*
    };
}

real_calls! {
    fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t;
    fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t;
    fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;
    fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int;
    fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int;
    fn close(fd: c_int) -> c_int;
    fn sleep(seconds: c_uint) -> c_uint;
    fn usleep(usec: useconds_t) -> c_int;
    fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int;
}

#[cfg(feature = "interpose")]
fn resolve(name: &'static str) -> usize {
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) };
    if addr.is_null() {
        myrpc_core::fatal!("dlsym(RTLD_NEXT, {}) found no definition", name.trim_end_matches('\0'));
    }
    addr as usize
}

#[inline]
pub(crate) fn errno() -> c_int {
    nix::errno::Errno::last() as c_int
}

#[inline]
pub(crate) fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}
