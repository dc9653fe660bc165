//! Fiber stacks backed by mmap
//!
//! Layout of one mapping (addresses grow upward):
//!
//! ```text
//! base                      base + guard                 base + len
//!  | guard page (PROT_NONE) | usable stack (RW, lazy) ... | <- top
//! ```
//!
//! The mapping is MAP_NORESERVE, so physical pages are only committed
//! as the stack is touched. Overflowing into the guard page faults
//! instead of silently corrupting a neighbouring allocation.

use myrpc_core::constants::GUARD_SIZE;
use myrpc_core::StackError;
use std::io;
use std::ptr::NonNull;

/// An owned, guard-protected stack mapping
pub struct FiberStack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

// Safety: the mapping is plain memory owned by this value
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes plus a guard page.
    pub fn new(size: usize) -> Result<Self, StackError> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        // Guard page at the low end; the stack grows down into it
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(StackError::Protect(source));
        }

        // mmap never hands back null on success
        let base = NonNull::new(base as *mut u8).ok_or(StackError::Map {
            size: len,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;

        Ok(Self { base, len, guard: page })
    }

    /// Highest address of the stack; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest writable address
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Bytes usable by the fiber, excluding the guard page
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.len - self.guard
    }

    /// Hand physical pages back to the kernel while keeping the mapping,
    /// so a terminated fiber can be reset without a fresh mmap.
    pub fn release_pages(&self) {
        let ret = unsafe {
            libc::madvise(
                self.bottom() as *mut libc::c_void,
                self.usable_size(),
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            tracing::debug!(error = %io::Error::last_os_error(), "madvise on fiber stack failed");
        }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "munmap of fiber stack failed");
        }
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("bottom", &self.bottom())
            .field("usable_size", &self.usable_size())
            .finish()
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        GUARD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_up_to_pages() {
        let stack = FiberStack::new(10_000).unwrap();
        let page = page_size();
        assert!(stack.usable_size() >= 10_000);
        assert_eq!(stack.usable_size() % page, 0);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.usable_size());
    }

    #[test]
    fn test_usable_range_is_writable() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        unsafe {
            stack.bottom().write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(stack.bottom().read(), 0xAB);
            assert_eq!(stack.top().sub(1).read(), 0xCD);
        }
    }

    #[test]
    fn test_release_pages_zeroes_contents() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        unsafe { stack.top().sub(8).write(0x5A) };
        stack.release_pages();
        // Anonymous private pages read back as zero after MADV_DONTNEED
        assert_eq!(unsafe { stack.top().sub(8).read() }, 0);
    }
}
