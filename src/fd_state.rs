//! Per-descriptor bookkeeping for the blocking-call layer.
//!
//! The runtime keeps every socket it touches in nonblocking mode and
//! remembers, per fd, whether the *application* asked for nonblocking
//! behaviour and which receive/send timeouts apply. State is created
//! lazily on first sight of an fd and dropped when the fd is closed
//! through [`crate::hook::close`].

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

/// Sentinel for "no timeout configured".
const NO_TIMEOUT: u64 = u64::MAX;

/// Which of the two cached socket timeouts an operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// What the runtime knows about one user-visible descriptor.
pub struct FdState {
    fd: RawFd,
    is_socket: bool,
    /// The descriptor itself is in nonblocking mode (always true for
    /// sockets under the runtime).
    sys_nonblock: AtomicBool,
    /// The application explicitly asked for nonblocking behaviour.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdState {
    fn new(fd: RawFd) -> FdState {
        let mut stat = unsafe { MaybeUninit::<libc::stat>::zeroed().assume_init() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;
        let mut sys_nonblock = false;
        if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }
        FdState {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_user_nonblock(&self, nonblocking: bool) {
        self.user_nonblock.store(nonblocking, Ordering::SeqCst);
    }

    pub(crate) fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Option<Duration> {
        let ms = self.timeout_cell(kind).load(Ordering::SeqCst);
        if ms == NO_TIMEOUT {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }

    pub(crate) fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMEOUT, |t| t.as_millis() as u64);
        self.timeout_cell(kind).store(ms, Ordering::SeqCst);
    }

    fn timeout_cell(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }
}

static TABLE: Lazy<RwLock<Vec<Option<Arc<FdState>>>>> = Lazy::new(|| RwLock::new(vec![None; 64]));

/// Existing state for `fd`, if any.
pub fn get(fd: RawFd) -> Option<Arc<FdState>> {
    if fd < 0 {
        return None;
    }
    TABLE.read().unwrap().get(fd as usize).and_then(|s| s.clone())
}

/// State for `fd`, created on first sight. Creation probes the fd with
/// `fstat` and puts sockets into nonblocking mode.
pub fn ensure(fd: RawFd) -> Arc<FdState> {
    debug_assert!(fd >= 0);
    if let Some(state) = get(fd) {
        return state;
    }
    let mut table = TABLE.write().unwrap();
    if table.len() <= fd as usize {
        table.resize(fd as usize * 3 / 2 + 1, None);
    }
    match &table[fd as usize] {
        Some(state) => state.clone(),
        None => {
            let state = Arc::new(FdState::new(fd));
            table[fd as usize] = Some(state.clone());
            state
        }
    }
}

/// Forget `fd`. Existing handles observe `is_closed`.
pub fn remove(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let mut table = TABLE.write().unwrap();
    if let Some(slot) = table.get_mut(fd as usize) {
        if let Some(state) = slot.take() {
            state.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_is_detected_and_made_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let state = ensure(fd);
        assert!(state.is_socket());
        assert!(state.sys_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn pipe_is_not_a_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let state = ensure(fds[0]);
        assert!(!state.is_socket());
        assert!(!state.sys_nonblock());
        remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn timeouts_round_trip() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let state = ensure(fd);
        assert_eq!(state.timeout(TimeoutKind::Recv), None);
        state.set_timeout(TimeoutKind::Recv, Some(Duration::from_millis(250)));
        assert_eq!(
            state.timeout(TimeoutKind::Recv),
            Some(Duration::from_millis(250))
        );
        assert_eq!(state.timeout(TimeoutKind::Send), None);
        state.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(state.timeout(TimeoutKind::Recv), None);
        remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn removed_state_reports_closed() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let state = ensure(fd);
        assert!(!state.is_closed());
        remove(fd);
        assert!(state.is_closed());
        assert!(get(fd).is_none());
        unsafe { libc::close(fd) };
    }
}
