//! Stackful coroutines with explicit, cooperative switching.
//!
//! A [`Fiber`] owns a stack and a saved machine context. Control moves
//! between fibers only at explicit points: [`Fiber::resume`] switches
//! into a fiber, [`yield_to_hold`] and [`yield_to_ready`] switch back
//! out. There is no preemption; a fiber runs until it yields or its
//! closure returns.
//!
//! Two kinds of fiber exist. A *work fiber* carries a closure and an
//! owned stack. A *thread root fiber* represents the thread's native
//! stack; it is created lazily, the first time a thread touches fibers,
//! and is what a work fiber switches back into when nothing else claims
//! the thread.
//!
//! The thread-local current/root slots are written only at context
//! switch boundaries, so they are never read and written concurrently.

use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::config;
use crate::scheduler;

mod context;
use context::{Context, Stack};

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Bound to a closure, never run.
    Init = 0,
    /// Parked by [`yield_to_hold`]; somebody else owns the wake-up.
    Hold = 1,
    /// Runnable, waiting for a worker.
    Ready = 2,
    /// Executing on exactly one worker thread.
    Exec = 3,
    /// Closure returned.
    Term = 4,
    /// Closure panicked; treated as terminated.
    Except = 5,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Ready,
            3 => State::Exec,
            4 => State::Term,
            5 => State::Except,
            other => unreachable!("invalid fiber state tag {}", other),
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static ALIVE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

struct Inner {
    ctx: Context,
    stack: Option<Stack>,
    f: Option<Box<dyn FnOnce() + Send>>,
}

/// A stackful coroutine. Shared as `Arc<Fiber>` so the scheduler and the
/// code that submitted it can both hold on to it.
pub struct Fiber {
    id: u64,
    /// True for the thread root fiber, which has no stack of its own.
    root: bool,
    /// Switch back to the thread root fiber instead of the scheduling
    /// fiber. Set only for a scheduler's caller-thread loop fiber.
    back_to_root: bool,
    state: AtomicU8,
    inner: UnsafeCell<Inner>,
}

// `inner` is only touched by the thread that currently runs or resumes
// the fiber, and EXEC on two workers at once is an invariant violation,
// so handing the handle across threads is sound.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Work fiber with the configured default stack size.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_flags(Box::new(f), 0, false)
    }

    /// Work fiber with an explicit stack size, rounded up to whole pages.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_flags(Box::new(f), stack_size, false)
    }

    /// `stack_size == 0` means the configured default. `back_to_root`
    /// makes the fiber switch back to the thread root fiber on yield.
    pub(crate) fn with_flags(
        f: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        back_to_root: bool,
    ) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            config::get().fiber.stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(stack_size);
        let ctx = Context::with_entry(&stack, fiber_entry);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        ALIVE.fetch_add(1, Ordering::Relaxed);
        debug!("fiber {} created", id);
        Arc::new(Fiber {
            id,
            root: false,
            back_to_root,
            state: AtomicU8::new(State::Init as u8),
            inner: UnsafeCell::new(Inner {
                ctx,
                stack: Some(stack),
                f: Some(f),
            }),
        })
    }

    /// The fiber representing a thread's native stack.
    fn new_root() -> Arc<Fiber> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        ALIVE.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id,
            root: true,
            back_to_root: false,
            state: AtomicU8::new(State::Exec as u8),
            inner: UnsafeCell::new(Inner {
                ctx: Context::empty(),
                stack: None,
                f: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    /// Rebind a finished fiber to a new closure, reusing its stack.
    pub fn reset<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(self: &Arc<Self>, f: Box<dyn FnOnce() + Send>) {
        let state = self.state();
        assert!(
            state == State::Init || state == State::Term || state == State::Except,
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );
        assert!(!self.root, "reset on a thread root fiber");
        // Not running (checked above), so this is the sole access.
        let inner = unsafe { &mut *self.inner.get() };
        let stack = inner.stack.as_ref().expect("work fiber has a stack");
        inner.ctx.rearm(stack, fiber_entry);
        inner.f = Some(f);
        self.set_state(State::Init);
    }

    /// Transfer control into this fiber until it yields or finishes.
    ///
    /// Must be called from the fiber this one switches back into: a
    /// worker's scheduling fiber, or the thread root fiber.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state == State::Init || state == State::Ready || state == State::Hold,
            "resume on fiber {} in state {:?}",
            self.id,
            state
        );
        let from = switch_target(self);
        debug_assert!(
            Arc::ptr_eq(&from, &current()),
            "fiber {} resumed off its scheduling fiber",
            self.id
        );
        self.set_state(State::Exec);
        set_current(self.clone());
        let save = ctx_ptr(&from);
        let load = ctx_ptr(self) as *const Context;
        // Both fibers outlive the switch: the caller holds `self`, and
        // `from` is pinned by the thread-local root/scheduling slot.
        unsafe { context::swap(save, load) };
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        ALIVE.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.root {
            debug_assert_eq!(state, State::Exec);
        } else {
            // Dropping a parked fiber strands whatever lives on its stack.
            debug_assert!(
                state == State::Init || state == State::Term || state == State::Except,
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        }
        debug!("fiber {} destroyed", self.id);
    }
}

/// Handle to the fiber executing on this thread. Lazily creates the
/// thread root fiber the first time a plain thread asks.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    root()
}

/// Id of the current fiber, or 0 if the thread has never touched fibers.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
}

/// Number of live fibers in the process, thread root fibers included.
pub fn alive_count() -> usize {
    ALIVE.load(Ordering::Relaxed)
}

/// Park the current fiber. Ownership of the wake-up lies with whoever
/// holds a handle to it. No-op on a thread root fiber.
pub fn yield_to_hold() {
    switch_out(State::Hold);
}

/// Yield the current fiber but leave it runnable; the scheduler puts it
/// back on the queue. No-op on a thread root fiber.
pub fn yield_to_ready() {
    switch_out(State::Ready);
}

fn switch_out(state: State) {
    let cur = current();
    if cur.root {
        return;
    }
    cur.set_state(state);
    let target = switch_target(&cur);
    let save = ctx_ptr(&cur);
    let load = ctx_ptr(&target) as *const Context;
    set_current(target);
    // The target lives in the thread-local slot it came from; `cur` is
    // kept alive by whoever scheduled or holds it.
    unsafe { context::swap(save, load) };
}

/// The fiber `f` switches back into when it yields or terminates.
fn switch_target(f: &Arc<Fiber>) -> Arc<Fiber> {
    if f.back_to_root {
        root()
    } else {
        scheduler::scheduling_fiber().unwrap_or_else(root)
    }
}

fn root() -> Arc<Fiber> {
    ROOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            let f = Fiber::new_root();
            // If nothing is current yet, the native stack is what runs.
            CURRENT.with(|c| {
                let mut c = c.borrow_mut();
                if c.is_none() {
                    *c = Some(f.clone());
                }
            });
            *slot = Some(f);
        }
        slot.as_ref().expect("root fiber just installed").clone()
    })
}

fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

fn ctx_ptr(f: &Fiber) -> *mut Context {
    unsafe { &mut (*f.inner.get()).ctx }
}

/// Entry trampoline for every work fiber. Runs the closure, records the
/// outcome, then switches back to the scheduling (or root) fiber. Must
/// never return from its native frame.
extern "C" fn fiber_entry() {
    let cur = current();
    debug_assert!(!cur.root);
    let f = unsafe { (*cur.inner.get()).f.take() };
    let f = f.expect("fiber entered without a closure");
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => cur.set_state(State::Term),
        Err(payload) => {
            cur.set_state(State::Except);
            error!(
                "fiber {} terminated by panic: {}\n{}",
                cur.id,
                payload_message(payload.as_ref()),
                std::backtrace::Backtrace::force_capture()
            );
        }
    }
    let target = switch_target(&cur);
    let save = ctx_ptr(&cur);
    let load = ctx_ptr(&target) as *const Context;
    set_current(target);
    // The resuming side still holds a handle to `cur`; drop ours so the
    // stack can be reclaimed once that handle goes.
    drop(cur);
    unsafe { context::swap(save, load) };
    unreachable!("terminated fiber resumed");
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}
