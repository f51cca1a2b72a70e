//! Fiber-aware blocking calls.
//!
//! Worker threads run with this layer enabled: a call that would block
//! parks the calling fiber on the reactor, optionally bounded by a
//! conditional timer, and retries once readiness arrives. On any other
//! thread every wrapper falls through to the plain libc call, so the
//! byte-stream semantics are identical either way; only the timing
//! differs.
//!
//! The retry cycle for a hooked descriptor:
//!
//! 1. issue the syscall, retrying `EINTR`;
//! 2. on `EAGAIN`, arm the fd event (and a timeout timer if the fd has
//!    one configured) and park;
//! 3. on wake-up, cancel the timer; a fired timer means `ETIMEDOUT`,
//!    anything else means go to 1.
//!
//! Exactly one of success, timeout or the underlying syscall error is
//! observed, and the pre-wait state is restored before returning.

use std::cell::Cell;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::error;

use crate::config;
use crate::fd_state::{self, TimeoutKind};
use crate::fiber;
use crate::io::{IoEvent, IoManager};
use crate::net;
use crate::scheduler;

thread_local! {
    static ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether blocking calls on this thread park fibers instead of the
/// thread. True on scheduler workers, false everywhere else.
pub fn is_enabled() -> bool {
    ENABLED.with(|e| e.get())
}

pub(crate) fn set_enabled(enabled: bool) {
    ENABLED.with(|e| e.set(enabled));
}

/// Set by a fired timeout timer, observed by the parked fiber.
struct TimeoutFlag {
    timed_out: AtomicBool,
}

/// Create a socket. Under the runtime the fd is registered and put into
/// nonblocking mode immediately.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if is_enabled() {
        fd_state::ensure(fd);
    }
    Ok(fd)
}

/// Read from `fd` into `buf`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, IoEvent::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// `recv(2)` with explicit flags.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// Write `buf` to `fd`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, IoEvent::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// `send(2)` with explicit flags.
pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// Accept one connection on a listening socket. Returns the connected
/// fd, already registered with the runtime, and the peer address.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let client = do_io(fd, IoEvent::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ) as libc::ssize_t
    })? as RawFd;
    if is_enabled() {
        fd_state::ensure(client);
    }
    let peer = net::sockaddr_to_addr(&storage)?;
    Ok((client, peer))
}

/// Connect `fd` to `addr`, parking the calling fiber until the socket
/// is writable. `timeout` falls back to `tcp.connect_timeout_ms`. After
/// the wait the real outcome is read back with `SO_ERROR`.
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let (storage, len) = net::addr_to_sockaddr(addr);
    let raw_connect = || unsafe {
        libc::connect(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };

    let hooked = is_enabled()
        && match fd_state::get(fd) {
            Some(state) => {
                if state.is_closed() {
                    return Err(io::Error::from_raw_os_error(libc::EBADF));
                }
                state.is_socket() && !state.user_nonblock()
            }
            None => false,
        };
    if !hooked {
        if raw_connect() == 0 {
            return Ok(());
        }
        return Err(io::Error::last_os_error());
    }

    if raw_connect() == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let io_mgr = match IoManager::current() {
        Some(io_mgr) => io_mgr,
        None => return Err(err),
    };
    let timeout =
        timeout.unwrap_or_else(|| Duration::from_millis(config::get().tcp.connect_timeout_ms));
    let flag = Arc::new(TimeoutFlag {
        timed_out: AtomicBool::new(false),
    });
    let timer = arm_timeout(&io_mgr, &flag, fd, IoEvent::WRITE, timeout);

    match io_mgr.add_event(fd, IoEvent::WRITE, None) {
        Ok(()) => {
            fiber::yield_to_hold();
            timer.cancel();
            if flag.timed_out.load(Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
            }
        }
        Err(e) => {
            timer.cancel();
            error!("connect could not arm WRITE on fd {}: {}", fd, e);
            return Err(into_io_error(e));
        }
    }

    let mut so_error: libc::c_int = 0;
    let mut so_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut so_len,
        )
    } != 0
    {
        return Err(io::Error::last_os_error());
    }
    if so_error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(so_error))
    }
}

/// Park the calling fiber for `duration` when hooked; otherwise the
/// calling thread.
pub fn sleep(duration: Duration) {
    if !is_enabled() {
        std::thread::sleep(duration);
        return;
    }
    let io_mgr = match IoManager::current() {
        Some(io_mgr) => io_mgr,
        None => {
            std::thread::sleep(duration);
            return;
        }
    };
    let me = fiber::current();
    let sched = scheduler::current().unwrap_or_else(|| io_mgr.scheduler().clone());
    io_mgr.add_timer(
        duration,
        move || sched.schedule(me.clone()),
        false,
    );
    fiber::yield_to_hold();
}

/// Close `fd`, waking any fiber parked on it and dropping its state.
pub fn close(fd: RawFd) -> io::Result<()> {
    if fd_state::get(fd).is_some() {
        if let Some(io_mgr) = IoManager::current() {
            io_mgr.cancel_all(fd);
        }
        fd_state::remove(fd);
    }
    if unsafe { libc::close(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Record the application's `O_NONBLOCK` intent. For a socket under the
/// runtime only the user-visible flag changes; the descriptor itself
/// stays nonblocking. Other descriptors get the real fcntl.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    if let Some(state) = fd_state::get(fd) {
        if state.is_socket() && !state.is_closed() {
            state.set_user_nonblock(nonblocking);
            if state.sys_nonblock() {
                return Ok(());
            }
        }
    }
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Cache a socket receive/send timeout for the runtime and forward it
/// to the kernel. The cached value is what drives hooked calls.
pub fn set_socket_timeout(
    fd: RawFd,
    kind: TimeoutKind,
    timeout: Option<Duration>,
) -> io::Result<()> {
    if let Some(state) = fd_state::get(fd) {
        state.set_timeout(kind, timeout);
    }
    let tv = libc::timeval {
        tv_sec: timeout.map_or(0, |t| t.as_secs() as libc::time_t),
        tv_usec: timeout.map_or(0, |t| t.subsec_micros() as libc::suseconds_t),
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    } != 0
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shared retry/park/retry cycle for readiness-driven calls.
fn do_io<F>(fd: RawFd, event: IoEvent, kind: TimeoutKind, mut syscall: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return retry_eintr(&mut syscall);
    }
    let state = match fd_state::get(fd) {
        Some(state) => state,
        None => return retry_eintr(&mut syscall),
    };
    if state.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !state.is_socket() || state.user_nonblock() {
        return retry_eintr(&mut syscall);
    }

    let timeout = state.timeout(kind);
    let flag = Arc::new(TimeoutFlag {
        timed_out: AtomicBool::new(false),
    });

    loop {
        let mut n = syscall();
        while n == -1 && errno() == libc::EINTR {
            n = syscall();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }

        let io_mgr = match IoManager::current() {
            Some(io_mgr) => io_mgr,
            None => return Err(err),
        };
        let timer = timeout.map(|t| arm_timeout(&io_mgr, &flag, fd, event, t));
        if let Err(e) = io_mgr.add_event(fd, event, None) {
            error!("could not arm {:?} on fd {}: {}", event, fd, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(into_io_error(e));
        }
        fiber::yield_to_hold();
        // Woken by the reactor or by the timeout timer.
        if let Some(timer) = &timer {
            timer.cancel();
        }
        if flag.timed_out.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
    }
}

/// Conditional timer that cancels the fd wait and marks `ETIMEDOUT`.
/// Tied to the flag's lifetime, so a completed call defuses it.
fn arm_timeout(
    io_mgr: &Arc<IoManager>,
    flag: &Arc<TimeoutFlag>,
    fd: RawFd,
    event: IoEvent,
    timeout: Duration,
) -> crate::timer::Timer {
    let weak_flag = Arc::downgrade(flag);
    let weak_io: Weak<IoManager> = Arc::downgrade(io_mgr);
    io_mgr.add_conditional_timer(
        timeout,
        move || {
            let flag = match weak_flag.upgrade() {
                Some(flag) => flag,
                None => return,
            };
            if flag.timed_out.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(io_mgr) = weak_io.upgrade() {
                io_mgr.cancel_event(fd, event);
            }
        },
        Arc::downgrade(flag),
        false,
    )
}

fn retry_eintr<F>(syscall: &mut F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let n = syscall();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn errno() -> libc::c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn into_io_error(err: crate::Error) -> io::Error {
    match err {
        crate::Error::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
