//! Epoll-driven reactor over the scheduler.
//!
//! An [`IoManager`] owns a [`Scheduler`] and a [`TimerManager`] and
//! supplies the scheduler's idle fiber: an edge-triggered `epoll_wait`
//! loop bounded by the earliest timer deadline. A fiber that needs a
//! descriptor to become readable or writable registers itself with
//! [`IoManager::add_event`] and parks; the reactor re-schedules it when
//! the kernel reports readiness. A self-pipe wakes a parked worker when
//! new work or an earlier deadline arrives.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error};
use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber};
use crate::scheduler::{self, Job, Scheduler, SchedulerHooks};
use crate::timer::{Timer, TimerCallback, TimerManager};
use crate::Result;

bitflags! {
    /// Readiness a waiter can register for. The bit values match
    /// `EPOLLIN` and `EPOLLOUT`, so the mask goes to the kernel as is.
    pub struct IoEvent: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// Epoll user-data token marking the wake pipe.
const WAKE_TOKEN: u64 = u64::MAX;
/// Upper bound on one `epoll_wait`, so sleeping workers re-check state.
const MAX_TIMEOUT_MS: u64 = 3000;
/// Kernel events drained per reactor pass.
const EVENT_BATCH: usize = 64;

enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct EventCtx {
    sched: Arc<Scheduler>,
    waiter: Waiter,
}

struct FdSlots {
    registered: IoEvent,
    read: Option<EventCtx>,
    write: Option<EventCtx>,
}

impl Default for FdSlots {
    fn default() -> Self {
        FdSlots {
            registered: IoEvent::empty(),
            read: None,
            write: None,
        }
    }
}

struct FdContext {
    fd: RawFd,
    slots: Mutex<FdSlots>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            slots: Mutex::new(FdSlots::default()),
        })
    }
}

fn slot_for(slots: &mut FdSlots, event: IoEvent) -> &mut Option<EventCtx> {
    if event == IoEvent::READ {
        &mut slots.read
    } else {
        &mut slots.write
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Weak<IoManager>>> = RefCell::new(None);
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    wake_fds: [RawFd; 2],
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Armed event-context slots across every fd.
    pending: AtomicUsize,
    stopped: AtomicBool,
    me: OnceCell<Weak<IoManager>>,
}

impl IoManager {
    /// Build the reactor, wire it into a new scheduler and start the
    /// workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut wake_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(wake_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }
        for &fd in wake_fds.iter() {
            if let Err(err) = set_nonblock(fd) {
                unsafe {
                    libc::close(epfd);
                    libc::close(wake_fds[0]);
                    libc::close(wake_fds[1]);
                }
                return Err(err.into());
            }
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fds[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(wake_fds[0]);
                libc::close(wake_fds[1]);
            }
            return Err(err.into());
        }

        let io_mgr = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            wake_fds,
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            me: OnceCell::new(),
        });
        io_mgr
            .me
            .set(Arc::downgrade(&io_mgr))
            .ok()
            .expect("fresh manager has no self reference");
        io_mgr.resize_contexts(32);
        let hooks: Weak<dyn SchedulerHooks> = Arc::downgrade(&(io_mgr.clone() as Arc<dyn SchedulerHooks>));
        io_mgr.sched.install_hooks(hooks);
        let waker = Arc::downgrade(&io_mgr);
        io_mgr.timers.set_waker(Box::new(move || {
            if let Some(io_mgr) = waker.upgrade() {
                io_mgr.wake();
            }
        }));
        io_mgr.sched.start();
        Ok(io_mgr)
    }

    /// The reactor driving the current worker thread.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Run a closure on any worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.spawn(f);
    }

    /// Run a closure pinned to one worker.
    pub fn spawn_on<F>(&self, worker: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.spawn_on(worker, f);
    }

    /// Queue a fiber for execution.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.sched.schedule(fiber);
    }

    /// See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, period: Duration, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(period, f, recurring)
    }

    /// See [`TimerManager::add_conditional_timer`].
    pub fn add_conditional_timer<F, T>(
        &self,
        period: Duration,
        f: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(period, f, cond, recurring)
    }

    /// Armed event-context slots across every fd.
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Register interest in one of `READ` or `WRITE` on `fd`. Without a
    /// callback the current fiber is captured and re-scheduled when the
    /// event fires; the caller is expected to park itself right after.
    ///
    /// Registering an event that is already armed on the fd panics.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        assert!(
            event == IoEvent::READ || event == IoEvent::WRITE,
            "add_event takes exactly one event, got {:?}",
            event
        );
        let ctx = self.context_for(fd);
        let mut slots = ctx.slots.lock().unwrap();
        assert!(
            !slots.registered.contains(event),
            "event {:?} already registered on fd {}",
            event,
            fd
        );

        let op = if slots.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | slots.registered.bits() | event.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let err = io::Error::last_os_error();
            error!("epoll_ctl(add {:?} on fd {}) failed: {}", event, fd, err);
            return Err(err.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        slots.registered |= event;
        let sched = scheduler::current().unwrap_or_else(|| self.sched.clone());
        let waiter = match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let cur = fiber::current();
                assert!(
                    !cur.is_root(),
                    "add_event without a callback must run inside a fiber"
                );
                Waiter::Fiber(cur)
            }
        };
        *slot_for(&mut slots, event) = Some(EventCtx { sched, waiter });
        Ok(())
    }

    /// Remove a registration without waking its waiter. False if nothing
    /// was registered.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if !slots.registered.contains(event) {
            return false;
        }
        let left = slots.registered & !event;
        if !self.epoll_update(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        slots.registered = left;
        *slot_for(&mut slots, event) = None;
        true
    }

    /// Remove a registration and wake its waiter as if the event had
    /// fired. Timeout logic relies on this.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if !slots.registered.contains(event) {
            return false;
        }
        let left = slots.registered & !event;
        if !self.epoll_update(fd, left) {
            return false;
        }
        Self::trigger(&mut slots, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel every armed event on `fd`, waking all waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if slots.registered.is_empty() {
            return false;
        }
        if !self.epoll_update(fd, IoEvent::empty()) {
            return false;
        }
        if slots.registered.contains(IoEvent::READ) {
            Self::trigger(&mut slots, IoEvent::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if slots.registered.contains(IoEvent::WRITE) {
            Self::trigger(&mut slots, IoEvent::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(slots.registered.is_empty());
        true
    }

    /// Stop the runtime: drain queued work and timers, join the workers.
    /// Idempotent.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sched.stop();
    }

    /// Clears the event bit and hands the waiter back to its scheduler.
    fn trigger(slots: &mut FdSlots, event: IoEvent) {
        debug_assert!(slots.registered.contains(event));
        slots.registered &= !event;
        let ctx = slot_for(slots, event)
            .take()
            .expect("armed event without a waiter");
        match ctx.waiter {
            Waiter::Fiber(f) => ctx.sched.schedule(f),
            Waiter::Call(cb) => ctx.sched.schedule_job(Job::Call(cb), None),
        }
    }

    fn epoll_update(&self, fd: RawFd, left: IoEvent) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            error!(
                "epoll_ctl(update fd {} to {:?}) failed: {}",
                fd,
                left,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.contexts.write().unwrap();
        if contexts.len() >= size {
            return;
        }
        let mut fd = contexts.len() as RawFd;
        contexts.resize_with(size, || {
            let ctx = FdContext::new(fd);
            fd += 1;
            ctx
        });
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let contexts = self.contexts.read().unwrap();
            if (fd as usize) < contexts.len() {
                return contexts[fd as usize].clone();
            }
        }
        self.resize_contexts(fd as usize * 3 / 2 + 1);
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    /// One byte into the self-pipe. A full pipe already guarantees a
    /// pending wake-up, so `EAGAIN` is fine.
    fn wake(&self) {
        let byte = [1u8];
        let rc = unsafe { libc::write(self.wake_fds[1], byte.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("reactor wake write failed: {}", err);
            }
        }
    }

    /// The idle fiber body: wait for kernel events or the next deadline,
    /// dispatch both, yield back to the dispatch loop.
    fn reactor_loop(&self) {
        debug!("reactor {} idle loop entered", self.sched.name());
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(EVENT_BATCH);
        loop {
            let next = self.timers.next_timeout_ms();
            if next == u64::MAX
                && self.pending.load(Ordering::SeqCst) == 0
                && self.sched.is_quiescent()
            {
                debug!("reactor {} idle loop exiting", self.sched.name());
                break;
            }

            let timeout = next.min(MAX_TIMEOUT_MS) as libc::c_int;
            let fired = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        EVENT_BATCH as libc::c_int,
                        timeout,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    error!("epoll_wait failed: {}", err);
                    break 0;
                }
            };
            unsafe { events.set_len(fired) };

            let mut expired: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut expired);
            if !expired.is_empty() {
                self.sched.schedule_jobs(
                    expired
                        .into_iter()
                        .map(|cb| Job::Call(Box::new(move || cb()) as Box<dyn FnOnce() + Send>)),
                );
            }

            for i in 0..fired {
                let ev = events[i];
                if ev.u64 == WAKE_TOKEN {
                    let mut byte = [0u8; 1];
                    while unsafe {
                        libc::read(self.wake_fds[0], byte.as_mut_ptr() as *mut libc::c_void, 1)
                    } == 1
                    {}
                    continue;
                }
                let fd = ev.u64 as RawFd;
                let ctx = match self.lookup(fd) {
                    Some(ctx) => ctx,
                    None => continue,
                };
                let mut slots = ctx.slots.lock().unwrap();
                let mut mask = ev.events;
                if mask & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // wake both directions so no waiter sleeps through an
                    // error on the descriptor
                    mask |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let ready = IoEvent::from_bits_truncate(mask) & slots.registered;
                if ready.is_empty() {
                    continue;
                }
                let left = slots.registered & !ready;
                if !self.epoll_update(ctx.fd, left) {
                    continue;
                }
                if ready.contains(IoEvent::READ) {
                    Self::trigger(&mut slots, IoEvent::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if ready.contains(IoEvent::WRITE) {
                    Self::trigger(&mut slots, IoEvent::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            fiber::yield_to_hold();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn on_thread_start(&self) {
        let me = self.me.get().cloned();
        CURRENT.with(|c| *c.borrow_mut() = me);
    }

    fn tickle(&self) {
        self.wake();
    }

    fn stopping(&self) -> bool {
        self.timers.next_timeout_ms() == u64::MAX
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.is_quiescent()
    }

    fn idle(&self) {
        self.reactor_loop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold a handle while running, so this is after stop().
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fds[0]);
            libc::close(self.wake_fds[1]);
        }
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched.name())
            .field("pending_events", &self.pending_event_count())
            .finish_non_exhaustive()
    }
}

fn set_nonblock(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
