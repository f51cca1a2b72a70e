use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filament::io::{IoEvent, IoManager};

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

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close_pipe(r: RawFd, w: RawFd) {
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

#[test]
fn pending_event_accounting() {
    let io = IoManager::new(1, false, "pending").unwrap();
    let (r, w) = make_pipe();
    assert_eq!(io.pending_event_count(), 0);

    io.add_event(r, IoEvent::READ, Some(Box::new(|| {}))).unwrap();
    assert_eq!(io.pending_event_count(), 1);
    assert!(io.del_event(r, IoEvent::READ));
    assert_eq!(io.pending_event_count(), 0);
    assert!(!io.del_event(r, IoEvent::READ));

    // the read end of an empty pipe reports neither readiness on its
    // own, so both armings stay put until cancelled
    let fired_read = Arc::new(AtomicBool::new(false));
    let fired_write = Arc::new(AtomicBool::new(false));
    let fr = fired_read.clone();
    let fw = fired_write.clone();
    io.add_event(r, IoEvent::READ, Some(Box::new(move || fr.store(true, Ordering::SeqCst))))
        .unwrap();
    io.add_event(r, IoEvent::WRITE, Some(Box::new(move || fw.store(true, Ordering::SeqCst))))
        .unwrap();
    assert_eq!(io.pending_event_count(), 2);
    assert!(io.cancel_all(r));
    assert_eq!(io.pending_event_count(), 0);
    assert!(wait_until(
        || fired_read.load(Ordering::SeqCst) && fired_write.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    assert!(!io.cancel_all(r));
    close_pipe(r, w);
    io.stop();
}

#[test]
fn cancel_event_fires_the_waiter() {
    let io = IoManager::new(1, false, "cancel").unwrap();
    let (r, w) = make_pipe();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    io.add_event(r, IoEvent::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
        .unwrap();
    assert!(io.cancel_event(r, IoEvent::READ));
    assert!(wait_until(
        || fired.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    assert_eq!(io.pending_event_count(), 0);
    // a second cancel has nothing to remove
    assert!(!io.cancel_event(r, IoEvent::READ));
    close_pipe(r, w);
    io.stop();
}

#[test]
fn del_event_never_fires_the_waiter() {
    let io = IoManager::new(1, false, "del").unwrap();
    let (r, w) = make_pipe();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    io.add_event(r, IoEvent::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
        .unwrap();
    assert!(io.del_event(r, IoEvent::READ));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!fired.load(Ordering::SeqCst));
    close_pipe(r, w);
    io.stop();
}

#[test]
fn readable_descriptor_fires_the_event() {
    let io = IoManager::new(1, false, "readable").unwrap();
    let (r, w) = make_pipe();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    io.add_event(r, IoEvent::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
        .unwrap();
    assert_eq!(
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
        1
    );
    assert!(wait_until(
        || fired.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    assert_eq!(io.pending_event_count(), 0);
    close_pipe(r, w);
    io.stop();
}

#[test]
fn fiber_parked_on_an_event_is_resumed() {
    let io = IoManager::new(2, false, "park").unwrap();
    let (r, w) = make_pipe();
    let got = Arc::new(AtomicBool::new(false));
    let g = got.clone();
    io.spawn(move || {
        let io = IoManager::current().unwrap();
        io.add_event(r, IoEvent::READ, None).unwrap();
        filament::fiber::yield_to_hold();
        // resumed by the reactor once the pipe is readable
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(r, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
        assert_eq!(byte[0], b'y');
        g.store(true, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!got.load(Ordering::SeqCst));
    assert_eq!(
        unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) },
        1
    );
    assert!(wait_until(
        || got.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    close_pipe(r, w);
    io.stop();
}

#[test]
fn tickle_wakes_a_parked_worker_quickly() {
    let io = IoManager::new(2, false, "tickle").unwrap();
    // let both workers park in epoll_wait
    std::thread::sleep(Duration::from_millis(100));
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    let start = Instant::now();
    io.spawn(move || d.store(true, Ordering::SeqCst));
    assert!(wait_until(
        || done.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    // well under the 3000 ms epoll cap, so the wake path worked
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "wake-up took {:?}",
        start.elapsed()
    );
    io.stop();
}

#[test]
fn caller_mode_reactor_drains_on_stop() {
    let io = IoManager::new(1, true, "caller-io").unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    io.spawn(move || {
        filament::hook::sleep(Duration::from_millis(20));
        d.store(true, Ordering::SeqCst);
    });
    // the only worker is this thread, which has not dispatched yet
    assert!(!done.load(Ordering::SeqCst));
    io.stop();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn stop_drains_queued_work() {
    let io = IoManager::new(2, false, "drain").unwrap();
    let hits = Arc::new(AtomicBool::new(false));
    let h = hits.clone();
    io.spawn(move || {
        filament::hook::sleep(Duration::from_millis(50));
        h.store(true, Ordering::SeqCst);
    });
    io.stop();
    assert!(hits.load(Ordering::SeqCst));
}
