//! M:N task dispatch onto a pool of worker threads.
//!
//! A [`Scheduler`] owns a FIFO of tasks, each either a ready fiber or a
//! closure promoted to a fiber at dispatch time, optionally pinned to
//! one worker. Workers pop eligible tasks and resume them on their own
//! scheduling fiber; a worker with nothing to do resumes its idle fiber,
//! which a reactor replaces with an event loop via [`SchedulerHooks`].
//!
//! With `use_caller` the constructing thread enrolls as the last worker:
//! its scheduling loop runs on a dedicated fiber that [`Scheduler::stop`]
//! resumes until the queue is drained.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use log::{debug, error, info, trace};

use crate::fiber::{self, Fiber, State};
use crate::hook;

/// Callbacks a reactor installs into the scheduler it owns. The base
/// scheduler falls back to spinning when none are present.
pub(crate) trait SchedulerHooks: Send + Sync {
    /// Runs at the top of every worker loop, on the worker's own thread.
    fn on_thread_start(&self);
    /// Wake a worker that may be parked waiting for I/O.
    fn tickle(&self);
    /// Whether the whole runtime, not just the queue, is drained.
    fn stopping(&self) -> bool;
    /// Body of the idle fiber; must yield whenever work may be available
    /// and return once `stopping` holds.
    fn idle(&self);
}

pub(crate) enum Job {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    job: Job,
    worker: Option<usize>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static WORKER: Cell<Option<usize>> = Cell::new(None);
}

/// Scheduler driving the current thread, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Index of the worker the current thread runs as.
pub fn current_worker() -> Option<usize> {
    WORKER.with(|w| w.get())
}

/// The fiber whose stack carries the dispatch loop on this thread.
pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|s| s.borrow().clone())
}

pub struct Scheduler {
    name: String,
    /// OS threads spawned by `start`; excludes the caller-thread worker.
    spawned: usize,
    /// Total worker count, caller-thread worker included.
    workers: usize,
    use_caller: bool,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Caller-mode scheduling loop fiber, consumed by `stop`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    active: AtomicUsize,
    idle_workers: AtomicUsize,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

impl Scheduler {
    /// `threads` is the worker count and must be at least 1. With
    /// `use_caller` the constructing thread becomes the last worker and
    /// one fewer OS thread is spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one worker");
        let spawned = if use_caller { threads - 1 } else { threads };
        Arc::new(Scheduler {
            name: name.into(),
            spawned,
            workers: threads,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            hooks: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total worker count, including the caller-thread worker.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Workers currently parked in their idle fiber.
    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    pub(crate) fn install_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Spawn the worker threads. Idempotent; a stopped scheduler does
    /// not restart.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.use_caller {
            // Enroll the calling thread now; its loop runs during stop().
            let me = self.clone();
            let caller_worker = self.workers - 1;
            let loop_fiber = Fiber::with_flags(Box::new(move || me.run(caller_worker)), 0, true);
            SCHED_FIBER.with(|s| *s.borrow_mut() = Some(loop_fiber.clone()));
            CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
            WORKER.with(|w| w.set(Some(caller_worker)));
            fiber::current(); // materialize the root fiber for re-entry
            *self.root_fiber.lock().unwrap() = Some(loop_fiber);
        }
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.spawned {
            let me = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || me.run(i))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
        info!(
            "scheduler {} started, {} workers{}",
            self.name,
            self.workers,
            if self.use_caller { " (caller enrolled)" } else { "" }
        );
    }

    /// Run a closure on any worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task {
            job: Job::Call(Box::new(f)),
            worker: None,
        });
    }

    /// Run a closure pinned to one worker.
    pub fn spawn_on<F>(&self, worker: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(worker < self.workers, "worker {} out of range", worker);
        self.push(Task {
            job: Job::Call(Box::new(f)),
            worker: Some(worker),
        });
    }

    /// Queue a batch of closures, waking workers at most once.
    pub fn spawn_batch<I, F>(&self, batch: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.schedule_jobs(
            batch
                .into_iter()
                .map(|f| Job::Call(Box::new(f) as Box<dyn FnOnce() + Send>)),
        );
    }

    /// Queue a fiber for execution on any worker.
    ///
    /// A fiber must not sit in the queue twice; re-queueing happens only
    /// after it yields back.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.push(Task {
            job: Job::Fiber(fiber),
            worker: None,
        });
    }

    /// Queue a fiber pinned to one worker.
    pub fn schedule_on(&self, worker: usize, fiber: Arc<Fiber>) {
        assert!(worker < self.workers, "worker {} out of range", worker);
        self.push(Task {
            job: Job::Fiber(fiber),
            worker: Some(worker),
        });
    }

    pub(crate) fn schedule_job(&self, job: Job, worker: Option<usize>) {
        self.push(Task { job, worker });
    }

    pub(crate) fn schedule_jobs(&self, jobs: impl Iterator<Item = Job>) {
        let need_tickle;
        {
            let mut queue = self.queue.lock().unwrap();
            let before = queue.len();
            queue.extend(jobs.map(|job| Task { job, worker: None }));
            need_tickle = before == 0 && !queue.is_empty();
        }
        if need_tickle {
            self.tickle();
        }
    }

    fn push(&self, task: Task) {
        let need_tickle;
        {
            let mut queue = self.queue.lock().unwrap();
            need_tickle = queue.is_empty();
            queue.push_back(task);
        }
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        match self.hooks() {
            Some(hooks) => hooks.tickle(),
            None => trace!("scheduler {} tickle", self.name),
        }
    }

    /// Stop has been requested; the queue may still hold work.
    pub fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Stop requested, queue drained, nothing mid-flight.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().unwrap().is_empty()
    }

    fn fully_stopped(&self) -> bool {
        match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.is_quiescent(),
        }
    }

    /// Request termination, drain the queue and join every worker.
    ///
    /// In caller mode this must run on the constructing thread, whose
    /// scheduling loop executes here until quiescence.
    pub fn stop(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.spawned {
            self.tickle();
        }
        let root = self.root_fiber.lock().unwrap().take();
        if let Some(root) = root {
            assert!(
                current().map_or(false, |s| Arc::ptr_eq(&s, self)),
                "caller-mode scheduler stopped off its constructing thread"
            );
            self.tickle();
            if !self.fully_stopped() {
                root.resume();
            }
        }
        let threads = {
            let mut threads = self.threads.lock().unwrap();
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            if let Err(payload) = handle.join() {
                error!("scheduler {} worker panicked: {:?}", self.name, payload);
            }
        }
        info!("scheduler {} stopped", self.name);
    }

    /// The per-worker dispatch loop.
    fn run(self: Arc<Self>, worker: usize) {
        debug!("scheduler {} worker {} running", self.name, worker);
        hook::set_enabled(true);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        WORKER.with(|w| w.set(Some(worker)));
        if scheduling_fiber().is_none() {
            SCHED_FIBER.with(|s| *s.borrow_mut() = Some(fiber::current()));
        }
        if let Some(hooks) = self.hooks() {
            hooks.on_thread_start();
        }

        let me = self.clone();
        let idle_fiber = Fiber::new(move || match me.hooks() {
            Some(hooks) => hooks.idle(),
            None => me.idle(),
        });
        // Reused for closure tasks whose fiber ran to completion.
        let mut cached: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let task = {
                let mut queue = self.queue.lock().unwrap();
                let mut found = None;
                for (i, task) in queue.iter().enumerate() {
                    if let Some(pinned) = task.worker {
                        if pinned != worker {
                            // Someone else must pick this one up.
                            tickle_me = true;
                            continue;
                        }
                    }
                    if let Job::Fiber(ref f) = task.job {
                        if f.state() == State::Exec {
                            continue;
                        }
                    }
                    found = Some(i);
                    break;
                }
                found.and_then(|i| queue.remove(i)).map(|task| {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    task
                })
            };
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    job: Job::Fiber(f), ..
                }) => {
                    let state = f.state();
                    if state != State::Term && state != State::Except {
                        f.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    if f.state() == State::Ready {
                        self.schedule(f);
                    }
                }
                Some(Task {
                    job: Job::Call(cb), ..
                }) => {
                    let f = match cached.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::with_flags(cb, 0, false),
                    };
                    f.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        State::Ready => self.schedule(f),
                        State::Term | State::Except => cached = Some(f),
                        // Parked; whoever holds the handle re-queues it.
                        _ => {}
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        debug!(
                            "scheduler {} worker {} idle fiber finished",
                            self.name, worker
                        );
                        self.tickle();
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_workers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!("scheduler {} worker {} exiting", self.name, worker);
    }

    /// Fallback idle loop when no reactor is installed: spin until the
    /// scheduler is drained.
    fn idle(&self) {
        trace!("scheduler {} idle", self.name);
        while !self.is_quiescent() {
            fiber::yield_to_hold();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}
