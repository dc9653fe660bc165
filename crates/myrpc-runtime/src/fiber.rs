//! Stackful fibers
//!
//! A `Fiber` owns an mmap'd stack and a saved register context. Control
//! moves in and out with `switch_context`:
//!
//! ```text
//!   resumer                      fiber
//!   resume() --- pull ------->   runs until a suspension point
//!            <-- push(value) --  suspend()/block()/exit()/return
//! ```
//!
//! Status transitions are published by the resumer after the switch
//! returns, so another thread never observes READY/BLOCKED while the
//! fiber's stack is still live on this one.

use crate::arch::{self, Registers};
use crate::config::defaults;
use crate::hook::HookGuard;
use crate::stack::FiberStack;
use crate::tls;
use myrpc_core::{FiberId, FiberStatus, StackError};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Panic payload used to unwind a fiber for `exit` and `term`.
/// Caught in `fiber_main`; never reaches the resumer.
pub(crate) struct ForcedUnwind;

/// A cooperatively scheduled, stackful coroutine.
///
/// Created READY. Only one thread may hold a fiber in EXEC at a time:
/// `resume` claims it with a compare-and-swap, and a losing caller gets
/// a logged no-op.
pub struct Fiber {
    id: FiberId,
    status: AtomicU8,
    /// Bumped on every resume; lets wakers detect stale wake-ups
    resumes: AtomicU64,
    cancel: AtomicBool,
    ctx: UnsafeCell<Context>,
}

/// Touched only by the thread that holds the fiber in EXEC, or by the
/// owner while the fiber is parked.
struct Context {
    regs: Registers,
    caller: Registers,
    stack: FiberStack,
    entry: Option<Entry>,
    started: bool,
    /// Status to publish once control is back with the resumer
    next: FiberStatus,
    transfer: i64,
    /// Hook flag of the fiber, swapped with the thread's on each switch
    hook_enabled: bool,
}

// Safety: `ctx` is only accessed by whoever won the EXEC claim
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size
    pub fn new<F>(f: F) -> Result<Arc<Fiber>, StackError>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(defaults::STACK_SIZE, f)
    }

    pub fn with_stack_size<F>(stack_size: usize, f: F) -> Result<Arc<Fiber>, StackError>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = FiberStack::new(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            status: AtomicU8::new(FiberStatus::Ready as u8),
            resumes: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context {
                regs: Registers::default(),
                caller: Registers::default(),
                stack,
                entry: Some(Box::new(f)),
                started: false,
                next: FiberStatus::Ready,
                transfer: 0,
                hook_enabled: true,
            }),
        });
        // The Arc pins the fiber, so its address can seed the entry context
        unsafe { fiber.prepare() };
        Ok(fiber)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn status(&self) -> FiberStatus {
        FiberStatus::from(self.status.load(Ordering::Acquire))
    }

    /// Usable stack bytes
    pub fn stack_size(&self) -> usize {
        unsafe { (*self.ctx.get()).stack.usable_size() }
    }

    /// Number of times this fiber has been resumed
    #[inline]
    pub(crate) fn resume_epoch(&self) -> u64 {
        self.resumes.load(Ordering::Acquire)
    }

    /// Switch into the fiber until its next suspension point.
    ///
    /// Valid on READY or BLOCKED fibers. Returns the value pushed by the
    /// suspension point, or `None` (after logging) when the fiber could
    /// not be claimed.
    pub fn resume(&self) -> Option<i64> {
        let current = self.status();
        if !current.is_resumable() {
            warn!(fiber = %self.id, status = %current, "resume on a fiber that is not ready");
            return None;
        }
        if !self.claim(current) {
            warn!(fiber = %self.id, "concurrent resume ignored");
            return None;
        }
        Some(unsafe { self.run_claimed() })
    }

    /// Force the fiber to unwind its stack and become TERMINAL.
    ///
    /// Destructors on the fiber's stack run. A fiber that never started
    /// just drops its closure. Must be called by the fiber's owner on
    /// the thread that last ran it.
    pub fn term(&self) {
        let current = self.status();
        if current.is_terminal() {
            return;
        }
        if !current.is_resumable() || !self.claim(current) {
            warn!(fiber = %self.id, status = %current, "term on a running fiber ignored");
            return;
        }

        let ctx = self.ctx.get();
        unsafe {
            if !(*ctx).started {
                let entry = (*ctx).entry.take();
                self.status.store(FiberStatus::Terminal as u8, Ordering::Release);
                drop(entry);
                return;
            }
        }

        trace!(fiber = %self.id, "forcing fiber to unwind");
        self.cancel.store(true, Ordering::Release);
        unsafe { self.run_claimed() };
    }

    /// Re-arm the fiber with a new closure, reusing its stack mapping.
    ///
    /// A parked fiber (BLOCKED, or READY mid-run) is unwound first with
    /// `term`. Returns false if the fiber is running or could not finish
    /// unwinding.
    pub fn reset<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let started = unsafe { (*self.ctx.get()).started };
        if self.status().is_resumable() && started {
            self.term();
        }

        let current = self.status();
        let reusable = current.is_terminal() || (current == FiberStatus::Ready && !started);
        if !reusable || !self.claim(current) {
            warn!(fiber = %self.id, status = %current, "reset on a fiber that is still live");
            return false;
        }

        unsafe {
            let ctx = self.ctx.get();
            (*ctx).entry = Some(Box::new(f));
            self.cancel.store(false, Ordering::Release);
            self.prepare();
        }
        self.status.store(FiberStatus::Ready as u8, Ordering::Release);
        true
    }

    // ---------------------------------------------------------------
    // In-fiber API. Each is a logged no-op outside a fiber.
    // ---------------------------------------------------------------

    /// Yield back to the resumer as READY
    pub fn suspend() {
        Self::suspend_with(0)
    }

    /// Yield back to the resumer as READY, pushing `value` to it
    pub fn suspend_with(value: i64) {
        if Self::with_current(|f| f.switch_out(FiberStatus::Ready, value)).is_none() {
            warn!("Fiber::suspend called outside a fiber");
        }
    }

    /// Yield back to the resumer as BLOCKED, pending an external wake
    pub fn block() {
        if Self::with_current(|f| f.switch_out(FiberStatus::Blocked, 0)).is_none() {
            warn!("Fiber::block called outside a fiber");
        }
    }

    /// Finish the current fiber now. The stack unwinds, so destructors
    /// of live locals run before the fiber reaches TERMINAL.
    pub fn exit() {
        if Self::current_id().is_none() {
            warn!("Fiber::exit called outside a fiber");
            return;
        }
        if std::thread::panicking() {
            warn!("Fiber::exit called while unwinding");
            return;
        }
        panic::resume_unwind(Box::new(ForcedUnwind));
    }

    /// Id of the fiber running on this thread, or `FiberId::NONE`
    pub fn current_id() -> FiberId {
        Self::with_current(|f| f.id).unwrap_or(FiberId::NONE)
    }

    /// Status of the fiber running on this thread (always EXEC when set)
    pub fn current_status() -> Option<FiberStatus> {
        Self::with_current(|f| f.status())
    }

    /// Whether the running fiber has been asked to unwind by `term`
    pub fn is_cancelled() -> bool {
        Self::with_current(|f| f.cancel.load(Ordering::Acquire)).unwrap_or(false)
    }

    pub(crate) fn with_current<R>(f: impl FnOnce(&Fiber) -> R) -> Option<R> {
        let ptr = tls::current_fiber();
        if ptr.is_null() {
            return None;
        }
        // Safety: installed by `run_claimed` for as long as the fiber runs
        Some(f(unsafe { &*ptr }))
    }

    // ---------------------------------------------------------------
    // Switching internals
    // ---------------------------------------------------------------

    #[inline]
    fn claim(&self, from: FiberStatus) -> bool {
        self.status
            .compare_exchange(
                from as u8,
                FiberStatus::Exec as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// # Safety
    ///
    /// Fiber must not be running; caller has exclusive access to `ctx`.
    unsafe fn prepare(&self) {
        let ctx = self.ctx.get();
        let top = (*ctx).stack.top();
        arch::init_context(&mut (*ctx).regs, top, fiber_main, self as *const Fiber as usize);
        (*ctx).started = false;
        (*ctx).next = FiberStatus::Ready;
        (*ctx).transfer = 0;
        (*ctx).hook_enabled = true;
    }

    /// # Safety
    ///
    /// Caller must have moved the status to EXEC via `claim`.
    unsafe fn run_claimed(&self) -> i64 {
        let ctx = self.ctx.get();
        self.resumes.fetch_add(1, Ordering::AcqRel);
        (*ctx).started = true;

        let prev_fiber = tls::replace_current_fiber(self);
        let outer_hook = tls::set_hook_enabled((*ctx).hook_enabled);

        arch::switch_context(addr_of_mut!((*ctx).caller), addr_of!((*ctx).regs));

        (*ctx).hook_enabled = tls::set_hook_enabled(outer_hook);
        tls::replace_current_fiber(prev_fiber);

        let next = (*ctx).next;
        if next == FiberStatus::Terminal {
            (*ctx).stack.release_pages();
        }
        self.status.store(next as u8, Ordering::Release);
        (*ctx).transfer
    }

    /// Return control to the resumer. Runs on the fiber's own stack.
    fn switch_out(&self, next: FiberStatus, transfer: i64) {
        let ctx = self.ctx.get();
        unsafe {
            (*ctx).next = next;
            (*ctx).transfer = transfer;
            arch::switch_context(addr_of_mut!((*ctx).regs), addr_of!((*ctx).caller));
        }
        // A term() while parked lands here; unwind unless already doing so
        if self.cancel.load(Ordering::Acquire) && !std::thread::panicking() {
            panic::resume_unwind(Box::new(ForcedUnwind));
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let ctx = self.ctx.get_mut();
        if ctx.started && !self.status().is_terminal() {
            // Unmapping skips the destructors still on the stack
            warn!(fiber = %self.id, status = %self.status(), "dropping a fiber that never finished");
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// First frame on every fiber stack
extern "C" fn fiber_main(arg: usize) -> ! {
    // Safety: `arg` is the address of the Arc-pinned fiber being resumed
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = unsafe { (*fiber.ctx.get()).entry.take() };

    if let Some(entry) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            if payload.is::<ForcedUnwind>() {
                trace!(fiber = %fiber.id, "fiber unwound");
            } else {
                let _hooks = HookGuard::disable();
                error!(fiber = %fiber.id, "fiber panicked: {}", panic_message(&*payload));
            }
        }
    }

    let ctx = fiber.ctx.get();
    unsafe {
        (*ctx).next = FiberStatus::Terminal;
        (*ctx).transfer = 0;
        arch::switch_context(addr_of_mut!((*ctx).regs), addr_of!((*ctx).caller));
    }
    // A TERMINAL context is never switched back into; reset() rebuilds it
    std::process::abort()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
