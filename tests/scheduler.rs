use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::scheduler::{self, Scheduler};

fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn closures_run_exactly_once() {
    let sched = Scheduler::new(3, false, "once");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let hits = hits.clone();
        sched.spawn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 200);
}

#[test]
fn fifo_order_with_a_single_worker() {
    let sched = Scheduler::new(1, false, "fifo");
    sched.start();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..50 {
        let order = order.clone();
        sched.spawn(move || order.lock().unwrap().push(i));
    }
    sched.stop();
    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn pinned_tasks_run_on_their_worker() {
    let sched = Scheduler::new(2, false, "pin");
    sched.start();
    let good = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        for target in 0..2 {
            let good = good.clone();
            sched.spawn_on(target, move || {
                if scheduler::current_worker() == Some(target) {
                    good.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    }
    sched.stop();
    assert_eq!(good.load(Ordering::SeqCst), 40);
}

#[test]
fn pin_submitted_from_another_worker() {
    let sched = Scheduler::new(2, false, "pin-cross");
    sched.start();
    let done = Arc::new(AtomicUsize::new(0));
    let inner = sched.clone();
    let done_inner = done.clone();
    sched.spawn_on(1, move || {
        assert_eq!(scheduler::current_worker(), Some(1));
        let done = done_inner.clone();
        inner.spawn_on(0, move || {
            assert_eq!(scheduler::current_worker(), Some(0));
            done.fetch_add(1, Ordering::SeqCst);
        });
    });
    assert!(wait_until(
        || done.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    sched.stop();
}

#[test]
fn caller_thread_drains_the_queue() {
    let sched = Scheduler::new(1, true, "caller");
    sched.start();
    let main_thread = std::thread::current().id();
    let hits = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(None));
    for _ in 0..10 {
        let hits = hits.clone();
        let observed = observed.clone();
        sched.spawn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            *observed.lock().unwrap() = Some(std::thread::current().id());
        });
    }
    // no spawned workers exist, so nothing may run before stop
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(*observed.lock().unwrap(), Some(main_thread));
}

#[test]
fn yield_to_ready_requeues_the_fiber() {
    let sched = Scheduler::new(1, false, "requeue");
    sched.start();
    let phases = Arc::new(AtomicUsize::new(0));
    let p = phases.clone();
    sched.spawn(move || {
        p.fetch_add(1, Ordering::SeqCst);
        filament::fiber::yield_to_ready();
        p.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(
        || phases.load(Ordering::SeqCst) == 2,
        Duration::from_secs(5)
    ));
    sched.stop();
}

#[test]
fn panicking_task_does_not_kill_the_worker() {
    let sched = Scheduler::new(1, false, "contained");
    sched.start();
    sched.spawn(|| panic!("task failure"));
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    sched.spawn(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn scheduled_fibers_run_and_requeue() {
    let sched = Scheduler::new(2, false, "fibers");
    sched.start();
    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    let fiber = filament::fiber::Fiber::new(move || {
        s.fetch_add(1, Ordering::SeqCst);
        filament::fiber::yield_to_ready();
        s.fetch_add(1, Ordering::SeqCst);
    });
    sched.schedule(fiber);
    assert!(wait_until(
        || steps.load(Ordering::SeqCst) == 2,
        Duration::from_secs(5)
    ));
    sched.stop();
}
