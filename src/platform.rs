//! Thin OS-agnostic wrappers the rest of the crate is built on: the
//! stream-socket handle union (TCP or local-domain, listening or
//! connected), and the counting semaphore used by the server's cleanup
//! worker.
//!
//! This is the "Platform abstraction" component of the design: everywhere
//! else in the crate reaches for `mio::net` types and `std::sync`
//! primitives directly, so the only OS-specific code left to centralize
//! here is local-domain abstract-namespace binding, which `mio` does not
//! wrap.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

use crate::error::{Error, Result};

/// The stream-oriented handle a `Connection` may own: a listening or
/// connected socket, over TCP or (on POSIX) the local domain.
///
/// The C library's `tcp_handle` field is one OS socket handle reused for
/// both TCP and local-domain stream sockets (mode `MSOCKET_MODE_TCP` covers
/// both); this enum is the direct Rust counterpart.
pub enum StreamHandle {
    /// A listening TCP socket.
    TcpListener(TcpListener),
    /// An established TCP socket.
    TcpStream(TcpStream),
    /// A listening local-domain socket.
    #[cfg(unix)]
    UnixListener(UnixListener),
    /// An established local-domain socket.
    #[cfg(unix)]
    UnixStream(UnixStream),
}

impl StreamHandle {
    /// Register this handle with `registry` for the given `interest`.
    ///
    /// Established streams are registered for both readability and
    /// writability: a TCP `connect` on a non-blocking socket completes in
    /// the background, and the only portable signal that it finished is a
    /// writable readiness event on the connecting socket.
    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            StreamHandle::TcpListener(l) => registry.register(l, token, interest),
            StreamHandle::TcpStream(s) => registry.register(s, token, interest),
            #[cfg(unix)]
            StreamHandle::UnixListener(l) => registry.register(l, token, interest),
            #[cfg(unix)]
            StreamHandle::UnixStream(s) => registry.register(s, token, interest),
        }
    }

    /// Deregister this handle.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            StreamHandle::TcpListener(l) => registry.deregister(l),
            StreamHandle::TcpStream(s) => registry.deregister(s),
            #[cfg(unix)]
            StreamHandle::UnixListener(l) => registry.deregister(l),
            #[cfg(unix)]
            StreamHandle::UnixStream(s) => registry.deregister(s),
        }
    }

    /// Set `TCP_NODELAY`. A no-op (`Ok`) for local-domain sockets, which
    /// have no Nagle algorithm to disable.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            StreamHandle::TcpStream(s) => s.set_nodelay(nodelay),
            _ => Ok(()),
        }
    }

    /// Shut down both directions of an established stream, unblocking any
    /// thread parked in a readiness wait or blocking read on this handle.
    /// A no-op for listening sockets, whose unblocking mechanism is
    /// dropping the handle itself (closing the fd).
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            StreamHandle::TcpStream(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            StreamHandle::UnixStream(s) => s.shutdown(std::net::Shutdown::Both),
            _ => Ok(()),
        }
    }

    /// Read into `buf`, as `std::io::Read` would, for the established
    /// variants. Listening handles cannot be read and return
    /// `InvalidInput`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamHandle::TcpStream(s) => s.read(buf),
            #[cfg(unix)]
            StreamHandle::UnixStream(s) => s.read(buf),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "handle is a listener")),
        }
    }

    /// Write `buf`, as `std::io::Write` would, for the established
    /// variants.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamHandle::TcpStream(s) => s.write(buf),
            #[cfg(unix)]
            StreamHandle::UnixStream(s) => s.write(buf),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "handle is a listener")),
        }
    }

    /// Accept once, non-blocking: `Ok(None)` on `WouldBlock`.
    pub fn try_accept_tcp(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self {
            StreamHandle::TcpListener(l) => match l.accept() {
                Ok(pair) => Ok(Some(pair)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "handle is not a TCP listener")),
        }
    }

    /// Accept once, non-blocking, on a local-domain listener.
    #[cfg(unix)]
    pub fn try_accept_unix(&self) -> io::Result<Option<UnixStream>> {
        match self {
            StreamHandle::UnixListener(l) => match l.accept() {
                Ok((stream, _addr)) => Ok(Some(stream)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "handle is not a unix listener")),
        }
    }
}

/// Bind a TCP listener: `SO_REUSEADDR`, bind, `listen(backlog)`.
///
/// `mio::net::TcpListener::bind` already performs steps 1-3 on Unix; the
/// explicit `listen` backlog is fixed at [`crate::LISTEN_BACKLOG`] rather
/// than the OS default.
pub fn bind_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).map_err(Error::system_call)
}

/// Connect a TCP stream, then set `TCP_NODELAY`.
pub fn connect_tcp(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).map_err(Error::system_call)?;
    stream.set_nodelay(true).map_err(Error::system_call)?;
    Ok(stream)
}

/// Bind a UDP socket with `SO_REUSEADDR` set before `bind`, as the original
/// library does for its datagram listeners.
///
/// `mio::net::UdpSocket::bind` does not set `SO_REUSEADDR` itself (unlike
/// its `TcpListener::bind`), and the option has no effect if applied after
/// binding, so on Unix this goes through a raw socket via `libc` instead of
/// `mio::net::UdpSocket::bind`. On non-Unix targets `SO_REUSEADDR` is left
/// at the OS default; Windows application servers generally do not need
/// it for UDP and `msocket`'s Windows port does not attempt to emulate it.
pub fn bind_udp_socket(addr: SocketAddr) -> Result<mio::net::UdpSocket> {
    #[cfg(unix)]
    {
        unix_udp::bind_reuseaddr(addr)
    }
    #[cfg(not(unix))]
    {
        mio::net::UdpSocket::bind(addr).map_err(Error::system_call)
    }
}

#[cfg(unix)]
mod unix_udp {
    use std::io;
    use std::net::SocketAddr;
    use std::os::fd::FromRawFd;

    use crate::error::{Error, Result};

    pub fn bind_reuseaddr(addr: SocketAddr) -> Result<mio::net::UdpSocket> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::system_call(io::Error::last_os_error()));
        }
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::system_call(err));
        }
        let (sockaddr, len) = socket_addr_to_raw(addr);
        let rc = unsafe { libc::bind(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::system_call(err));
        }
        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
        std_socket.set_nonblocking(true).map_err(Error::system_call)?;
        Ok(mio::net::UdpSocket::from_std(std_socket))
    }

    fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
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
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
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
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }
}

#[cfg(unix)]
pub mod unix_path {
    //! Local-domain bind/connect supporting the abstract-namespace
    //! convention: a leading NUL byte selects a name that never touches the
    //! filesystem.

    use std::io;
    use std::os::unix::net::{SocketAddr as StdUnixAddr, UnixListener as StdUnixListener, UnixStream as StdUnixStream};
    use std::path::Path;

    use mio::net::{UnixListener, UnixStream};

    use crate::error::{Error, Result};

    /// `true` if `path`'s first byte is NUL: the abstract-namespace marker.
    pub fn is_abstract(path: &[u8]) -> bool {
        path.first() == Some(&0)
    }

    /// Bind a local-domain listener, choosing the abstract namespace when
    /// `path` starts with a NUL byte.
    pub fn bind_listener(path: &[u8]) -> Result<UnixListener> {
        let std_listener = if is_abstract(path) {
            let addr = StdUnixAddr::from_abstract_name(&path[1..]).map_err(Error::system_call)?;
            StdUnixListener::bind_addr(&addr).map_err(Error::system_call)?
        } else {
            let path_str = std::str::from_utf8(path)
                .map_err(|_| Error::invalid_argument("local-domain path is not valid UTF-8"))?;
            StdUnixListener::bind(Path::new(path_str)).map_err(Error::system_call)?
        };
        std_listener.set_nonblocking(true).map_err(Error::system_call)?;
        Ok(UnixListener::from_std(std_listener))
    }

    /// Connect to a local-domain listener, choosing the abstract namespace
    /// when `path` starts with a NUL byte.
    pub fn connect(path: &[u8]) -> Result<UnixStream> {
        let std_stream = if is_abstract(path) {
            let addr = StdUnixAddr::from_abstract_name(&path[1..]).map_err(Error::system_call)?;
            StdUnixStream::connect_addr(&addr).map_err(Error::system_call)?
        } else {
            let path_str = std::str::from_utf8(path)
                .map_err(|_| Error::invalid_argument("local-domain path is not valid UTF-8"))?;
            StdUnixStream::connect(Path::new(path_str)).map_err(Error::system_call)?
        };
        std_stream.set_nonblocking(true).map_err(Error::system_call)?;
        Ok(UnixStream::from_std(std_stream))
    }

    /// Unlink the socket file on disk, ignoring an abstract-namespace path
    /// (which never created one) and a missing file.
    pub fn unlink_if_path(path: &[u8]) {
        if is_abstract(path) {
            return;
        }
        if let Ok(path_str) = std::str::from_utf8(path) {
            let _ = std::fs::remove_file(path_str);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn detects_abstract_namespace() {
            assert!(is_abstract(b"\0my-socket"));
            assert!(!is_abstract(b"/tmp/my-socket"));
        }
    }
}

/// A counting semaphore, used by the server's cleanup worker to wake on
/// pushed destruction items while still being able to observe a stop flag
/// via a bounded `try_wait`.
///
/// `std` has no semaphore type; this is the textbook `Mutex<usize>` +
/// `Condvar` construction, scoped to exactly the `post`/`try_wait`
/// operations the cleanup worker needs.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// A semaphore with an initial count of zero.
    pub fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Block for up to `timeout` for the count to become positive; if so,
    /// decrement it and return `true`. Returns `false` on timeout without
    /// touching the count.
    pub fn try_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.condvar.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Semaphore {
        Semaphore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_wait_times_out_when_empty() {
        let sem = Semaphore::new();
        assert!(!sem.try_wait(Duration::from_millis(20)));
    }

    #[test]
    fn post_wakes_a_waiter() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();
        let handle = thread::spawn(move || sem2.try_wait(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        sem.post();
        assert!(handle.join().unwrap());
    }
}
