//! TCP primitives driven through the blocking-call layer, and a server
//! skeleton built on two reactors.
//!
//! [`TcpStream`] and [`TcpListener`] wrap raw descriptors; every
//! potentially blocking operation goes through [`crate::hook`], so
//! inside the runtime they park the calling fiber and outside it they
//! behave like their std counterparts. `SO_REUSEADDR` is set on every
//! listener and `TCP_NODELAY` on every stream socket.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config;
use crate::fd_state::{self, TimeoutKind};
use crate::hook;
use crate::io::IoManager;

/// A TCP connection. Reads and writes park the calling fiber when used
/// inside the runtime.
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect to the first reachable address. Inside the runtime the
    /// wait is cooperative; on a plain thread this falls back to the
    /// standard blocking connect.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> crate::Result<TcpStream> {
        Self::connect_impl(addr, None)
    }

    /// [`connect`](Self::connect) with an explicit timeout instead of
    /// the configured default.
    pub fn connect_timeout<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> crate::Result<TcpStream> {
        Self::connect_impl(addr, Some(timeout))
    }

    fn connect_impl<A: ToSocketAddrs>(
        addr: A,
        timeout: Option<Duration>,
    ) -> crate::Result<TcpStream> {
        let mut last_err: Option<io::Error> = None;
        for addr in addr.to_socket_addrs()? {
            match Self::connect_one(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
            })
            .into())
    }

    fn connect_one(addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
        if hook::is_enabled() && IoManager::current().is_some() {
            let fd = hook::socket(domain_of(addr), libc::SOCK_STREAM, 0)?;
            let stream = TcpStream { fd };
            stream.set_nodelay()?;
            hook::connect(fd, addr, timeout)?;
            Ok(stream)
        } else {
            let inner = match timeout {
                Some(timeout) => std::net::TcpStream::connect_timeout(addr, timeout)?,
                None => std::net::TcpStream::connect(addr)?,
            };
            inner.set_nonblocking(true)?;
            let fd = inner.into_raw_fd();
            fd_state::ensure(fd);
            let stream = TcpStream { fd };
            stream.set_nodelay()?;
            Ok(stream)
        }
    }

    pub(crate) fn from_raw(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }

    /// Receive timeout for hooked reads; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, TimeoutKind::Recv, timeout)
    }

    /// Send timeout for hooked writes; `None` waits forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::set_socket_timeout(self.fd, TimeoutKind::Send, timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getsockname)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getpeername)
    }

    fn set_nodelay(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::read(self.fd, buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if let Err(err) = hook::close(self.fd) {
            debug!("close({}) failed: {}", self.fd, err);
        }
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpStream").field("fd", &self.fd).finish()
    }
}

/// A listening TCP socket. [`accept`](Self::accept) parks the calling
/// fiber and must run inside the runtime.
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and listen on the first workable address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> crate::Result<TcpListener> {
        let mut last_err: Option<io::Error> = None;
        for addr in addr.to_socket_addrs()? {
            match Self::bind_one(&addr) {
                Ok(listener) => return Ok(listener),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to bind"))
            .into())
    }

    fn bind_one(addr: &SocketAddr) -> io::Result<TcpListener> {
        let fd = hook::socket(domain_of(addr), libc::SOCK_STREAM, 0)?;
        fd_state::ensure(fd);
        let listener = TcpListener { fd };
        let one: libc::c_int = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        let (storage, len) = addr_to_sockaddr(addr);
        if unsafe {
            libc::bind(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, libc::SOMAXCONN) } != 0 {
            return Err(io::Error::last_os_error());
        }
        info!("listening on {}", addr);
        Ok(listener)
    }

    /// Wait for one connection. The accepted stream is nonblocking,
    /// `TCP_NODELAY` and registered with the runtime.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (fd, peer) = hook::accept(self.fd)?;
        let stream = TcpStream::from_raw(fd);
        stream.set_nodelay()?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd, libc::getsockname)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if let Err(err) = hook::close(self.fd) {
            debug!("close({}) failed: {}", self.fd, err);
        }
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpListener").field("fd", &self.fd).finish()
    }
}

/// Per-connection entry point for [`TcpServer`]. Blanket-implemented
/// for closures.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, client: TcpStream);
}

impl<F> ConnectionHandler for F
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    fn handle(&self, client: TcpStream) {
        self(client)
    }
}

/// Server skeleton: listeners accept on one reactor and every accepted
/// client runs the handler as a fresh fiber on another (the two may be
/// the same manager).
pub struct TcpServer {
    worker: Arc<IoManager>,
    accept_worker: Arc<IoManager>,
    listeners: Mutex<Vec<Arc<TcpListener>>>,
    handler: Arc<dyn ConnectionHandler>,
    read_timeout: Duration,
    name: String,
    stopped: AtomicBool,
}

impl TcpServer {
    /// `worker` runs connection handlers, `accept_worker` runs the
    /// accept loops. Every accepted connection gets the configured
    /// `tcp_server.read_timeout_ms` as its receive timeout.
    pub fn new<H>(
        worker: Arc<IoManager>,
        accept_worker: Arc<IoManager>,
        handler: H,
    ) -> Arc<TcpServer>
    where
        H: ConnectionHandler,
    {
        Arc::new(TcpServer {
            worker,
            accept_worker,
            listeners: Mutex::new(Vec::new()),
            handler: Arc::new(handler),
            read_timeout: Duration::from_millis(config::get().tcp_server.read_timeout_ms),
            name: "filament/0.4.0".into(),
            stopped: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind one listening address. May be called repeatedly before
    /// [`start`](Self::start).
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> crate::Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.listeners.lock().unwrap().push(Arc::new(listener));
        Ok(())
    }

    /// Addresses actually bound; useful after binding port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Schedule one accept loop per bound listener. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let me = self.clone();
            self.accept_worker.spawn(move || me.accept_loop(listener));
        }
    }

    /// Stop accepting. The listeners are cancelled and closed from
    /// inside the accept reactor, so no accept fiber races the close.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.clone();
        self.accept_worker.spawn(move || {
            let listeners = std::mem::take(&mut *me.listeners.lock().unwrap());
            for listener in &listeners {
                if let Some(io_mgr) = IoManager::current() {
                    io_mgr.cancel_all(listener.as_raw_fd());
                }
            }
            // listeners drop and close here, on the accept worker
        });
    }

    fn accept_loop(&self, listener: Arc<TcpListener>) {
        while !self.stopped.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((client, peer)) => {
                    debug!("{}: accepted {}", self.name, peer);
                    if let Err(err) = client.set_read_timeout(Some(self.read_timeout)) {
                        warn!("{}: failed to set read timeout: {}", self.name, err);
                    }
                    let handler = self.handler.clone();
                    self.worker.spawn(move || handler.handle(client));
                }
                Err(err) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("{}: accept failed: {}", self.name, err);
                    if err.raw_os_error() == Some(libc::EBADF) {
                        break;
                    }
                }
            }
        }
        debug!("{}: accept loop exiting", self.name);
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn domain_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

pub(crate) fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                    sin,
                )
            };
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                    sin6,
                )
            };
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

pub(crate) fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe {
                *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", other),
        )),
    }
}

fn sockname(
    fd: RawFd,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<SocketAddr> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe {
        f(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    } != 0
    {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "192.168.1.20:8020".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(sockaddr_to_addr(&storage).unwrap(), addr);
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let (storage, len) = addr_to_sockaddr(&addr);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(sockaddr_to_addr(&storage).unwrap(), addr);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
        assert!(sockaddr_to_addr(&storage).is_err());
    }
}
