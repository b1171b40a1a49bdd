//! The per-connection I/O engine: one socket (TCP and/or UDP flavor), its
//! state, its handler table, its I/O worker, its receive buffer and its
//! inactivity timer.

mod worker;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mio::net::UdpSocket;

use crate::address::{AddressFamily, PeerInfo};
use crate::error::{Error, Result};
use crate::handler::HandlerTable;
use crate::platform::{self, StreamHandle};
use crate::MAX_CLOSE_ATTEMPTS;

/// Which of UDP/TCP a `Connection` currently has active.
///
/// A listening TCP `Connection` and a listening UDP `Connection` are
/// always distinct objects in this library (`listen`'s `mode` argument
/// must be exactly one of the two); `Mode` tracks the single bit that
/// ends up set on any one `Connection`, but is a small bitset rather than
/// an enum because `send` and `sendto` both test membership
/// independently and a TCP client `Connection` can in principle be
/// extended to also hold a UDP handle by calling both `connect`-style
/// setup paths (the C library's `socketMode` is a bitset for the same
/// reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mode(u8);

impl Mode {
    /// No handle active.
    pub const NONE: Mode = Mode(0);
    /// The UDP handle is active.
    pub const UDP: Mode = Mode(1);
    /// The TCP (or local-domain stream) handle is active.
    pub const TCP: Mode = Mode(2);

    /// `true` if every bit set in `other` is also set in `self`.
    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Mode) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Mode) {
        self.0 &= !other.0;
    }

    fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// A `Connection`'s lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly created, or reset after `close`.
    None,
    /// A TCP or local-domain listener, waiting for `accept` calls.
    Listening,
    /// Inside a blocking `accept` call.
    Accepting,
    /// Reserved for a connection mid-handshake; unused by the current
    /// POSIX/Windows implementation (`connect` is synchronous), kept so
    /// state transitions remain exhaustive for a future async `connect`.
    Pending,
    /// A connected TCP/local-domain stream, or an active UDP endpoint.
    Established,
    /// Shutdown-prepare has run; tearing down.
    Closing,
    /// Terminal: `close` has returned and reset every field.
    Closed,
}

/// One socket (TCP/local-domain and/or UDP), its state, its handler table,
/// its I/O worker thread and its inactivity timer.
///
/// Cheaply cloneable: cloning shares the same underlying socket and state
/// (an `Arc` handle), which is how a [`crate::Server`] hands a child to its
/// `tcp_accept` callback while the per-connection I/O worker thread keeps
/// its own clone alive for as long as it runs. There is deliberately no
/// single, exclusive owner (see `DESIGN.md` for why this departs from the
/// original single-owner C struct).
pub struct Connection<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Connection<C> {
    fn clone(&self) -> Connection<C> {
        Connection { shared: self.shared.clone() }
    }
}

struct Shared<C> {
    address_family: AddressFamily,
    inner: Mutex<Inner>,
    handler: Mutex<Option<(HandlerTable<C>, C)>>,
}

struct Inner {
    mode: Mode,
    state: State,
    stream: Option<StreamHandle>,
    udp: Option<UdpSocket>,
    tcp_peer: PeerInfo,
    udp_last_sender: PeerInfo,
    io_worker_running: bool,
    new_connection: bool,
    inactivity_ms: u32,
    inactivity_next_call_ms: u32,
    worker_thread_id: Option<ThreadId>,
    worker_handle: Option<JoinHandle<()>>,
}

impl Inner {
    fn fresh() -> Inner {
        Inner {
            mode: Mode::NONE,
            state: State::None,
            stream: None,
            udp: None,
            tcp_peer: PeerInfo::empty(),
            udp_last_sender: PeerInfo::empty(),
            io_worker_running: false,
            new_connection: false,
            inactivity_ms: 0,
            inactivity_next_call_ms: crate::INACTIVITY_TICK_MS,
            worker_thread_id: None,
            worker_handle: None,
        }
    }
}

impl<C: Clone + Send + 'static> Connection<C> {
    /// Create a `Connection` for the given address family. All fields start
    /// `None`/invalid; nothing is allocated beyond the `Connection` itself
    /// until `listen`/`connect`/`accept` opens a socket.
    pub fn new(address_family: AddressFamily) -> Result<Connection<C>> {
        Ok(Connection {
            shared: Arc::new(Shared {
                address_family,
                inner: Mutex::new(Inner::fresh()),
                handler: Mutex::new(None),
            }),
        })
    }

    /// The address family this `Connection` was constructed for.
    pub fn address_family(&self) -> AddressFamily {
        self.shared.address_family
    }

    /// A snapshot of the current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().unwrap().state
    }

    /// The peer of an established TCP connection.
    pub fn peer_addr(&self) -> PeerInfo {
        self.shared.inner.lock().unwrap().tcp_peer.clone()
    }

    /// The most recent UDP sender, if any datagram has arrived yet.
    pub fn last_udp_sender(&self) -> PeerInfo {
        self.shared.inner.lock().unwrap().udp_last_sender.clone()
    }

    /// Install the handler table and opaque context this `Connection` will
    /// invoke callbacks against.
    ///
    /// Must be called before `connect`, `listen`/`unix_listen`, or
    /// `start_io`; calling it afterwards races the I/O worker and is not
    /// supported. A copy of `table` is stored, and it (along with a clone
    /// of `context`) is handed to each new I/O worker this `Connection`
    /// spawns, which is what makes `connect` → `close` → `connect` deliver
    /// a second `tcp_connected` without the caller installing handlers
    /// again.
    pub fn set_handler(&self, table: HandlerTable<C>, context: C) {
        *self.shared.handler.lock().unwrap() = Some((table, context));
    }

    /// Create a listening socket of the requested `mode` bound to `port` on
    /// `addr` (or the wildcard address when `addr` is `None`).
    ///
    /// For UDP, the I/O worker is started immediately and delivers
    /// datagrams through `udp_msg`. For TCP the `Connection` only
    /// transitions to [`State::Listening`]; the application must call
    /// [`Connection::accept`] in a loop (this is what [`crate::Server`]
    /// does internally).
    pub fn listen(&self, mode: Mode, port: u16, addr: Option<&str>) -> Result<()> {
        if mode != Mode::UDP && mode != Mode::TCP {
            return Err(Error::invalid_argument("listen mode must be exactly UDP or TCP"));
        }
        let af = self.shared.address_family;
        #[cfg(unix)]
        if af == AddressFamily::Unix {
            return Err(Error::invalid_argument(
                "use unix_listen for the local-domain address family",
            ));
        }
        let ip = match addr {
            Some(a) => af.parse_numeric(a)?,
            None => af.wildcard(),
        };

        if mode == Mode::UDP {
            let socket = platform::bind_udp_socket(SocketAddr::new(ip, port))?;
            if af == AddressFamily::Inet {
                socket.set_broadcast(true).map_err(Error::system_call)?;
            }
            {
                let mut inner = self.shared.inner.lock().unwrap();
                inner.udp = Some(socket);
                inner.mode.insert(Mode::UDP);
                inner.state = State::Established;
            }
            self.start_io()?;
        } else {
            let listener = platform::bind_tcp_listener(SocketAddr::new(ip, port))?;
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stream = Some(StreamHandle::TcpListener(listener));
            inner.mode.insert(Mode::TCP);
            inner.state = State::Listening;
        }
        Ok(())
    }

    /// Join an IPv6 multicast group on this `Connection`'s UDP handle,
    /// using the default (any) interface.
    ///
    /// Resolves the Open Question in the original design about whether
    /// `addr` in `listen` means "bind interface" or "multicast group":
    /// here it is always the former, and multicast membership is this
    /// explicit, separate call.
    pub fn join_multicast_v6(&self, group: std::net::Ipv6Addr) -> Result<()> {
        let inner = self.shared.inner.lock().unwrap();
        match &inner.udp {
            Some(socket) => socket.join_multicast_v6(&group, 0).map_err(Error::system_call),
            None => Err(Error::invalid_argument("no UDP handle to join a multicast group on")),
        }
    }

    /// Connect as a TCP client to `addr:port`. Requires a handler table to
    /// already be installed and TCP not already active.
    ///
    /// On success the I/O worker is started automatically and, once
    /// running, delivers one `tcp_connected` callback before any
    /// `tcp_data`. `Connection::close` followed by a second `connect` on
    /// the same object is supported and delivers a second
    /// `tcp_connected`.
    pub fn connect(&self, addr: &str, port: u16) -> Result<()> {
        if self.shared.handler.lock().unwrap().is_none() {
            return Err(Error::invalid_argument("connect requires set_handler to run first"));
        }
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.mode.contains(Mode::TCP) {
                return Err(Error::invalid_argument("TCP is already active on this connection"));
            }
        }
        let af = self.shared.address_family;
        let ip = af.parse_numeric(addr)?;
        let socket_addr = SocketAddr::new(ip, port);
        let stream = match platform::connect_tcp(socket_addr) {
            Ok(stream) => stream,
            Err(e) => return Err(e),
        };
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.tcp_peer = PeerInfo::from_socket_addr(socket_addr);
            inner.stream = Some(StreamHandle::TcpStream(stream));
            inner.mode.insert(Mode::TCP);
            inner.state = State::Established;
            inner.new_connection = true;
        }
        if let Err(e) = self.start_io() {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stream = None;
            inner.mode.remove(Mode::TCP);
            inner.state = State::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Connect as a local-domain stream client.
    #[cfg(unix)]
    pub fn unix_connect(&self, path: &[u8]) -> Result<()> {
        if self.shared.handler.lock().unwrap().is_none() {
            return Err(Error::invalid_argument("unix_connect requires set_handler to run first"));
        }
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.mode.contains(Mode::TCP) {
                return Err(Error::invalid_argument("a stream handle is already active on this connection"));
            }
        }
        let stream = platform::unix_path::connect(path)?;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stream = Some(StreamHandle::UnixStream(stream));
            inner.mode.insert(Mode::TCP);
            inner.state = State::Established;
            inner.new_connection = true;
        }
        if let Err(e) = self.start_io() {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stream = None;
            inner.mode.remove(Mode::TCP);
            inner.state = State::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Listen on a local-domain stream socket at `path`. A leading NUL byte
    /// in `path` selects the abstract namespace.
    #[cfg(unix)]
    pub fn unix_listen(&self, path: &[u8]) -> Result<()> {
        let listener = platform::unix_path::bind_listener(path)?;
        let mut inner = self.shared.inner.lock().unwrap();
        inner.stream = Some(StreamHandle::UnixListener(listener));
        inner.mode.insert(Mode::TCP);
        inner.state = State::Listening;
        Ok(())
    }

    /// Accept one pending connection from a `Listening` TCP/local-domain
    /// `Connection`, blocking (via a bounded readiness poll, so a `close`
    /// from another thread can unblock it) until one arrives or the
    /// listening socket is closed.
    ///
    /// Unlike the original C API, accepted connections are always freshly
    /// allocated: the "placement" overload that re-initializes
    /// caller-provided storage exists in C purely to avoid an allocation,
    /// which an `Arc`-backed handle makes unnecessary here.
    pub fn accept(&self) -> Result<Connection<C>> {
        if self.state() != State::Listening {
            return Err(Error::invalid_argument("accept requires the Listening state"));
        }
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.state = State::Accepting;
        }
        let result = self.accept_loop();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == State::Accepting {
                inner.state = State::Listening;
            }
        }
        result
    }

    fn accept_loop(&self) -> Result<Connection<C>> {
        loop {
            if self.state() == State::Closing {
                return Err(Error::invalid_argument("listening socket was closed"));
            }
            let mut inner = self.shared.inner.lock().unwrap();
            let stream_handle = inner.stream.as_ref().ok_or_else(|| {
                Error::invalid_argument("no listening handle installed")
            })?;
            match stream_handle {
                StreamHandle::TcpListener(_) => {
                    if let Some((stream, addr)) = stream_handle
                        .try_accept_tcp()
                        .map_err(Error::system_call)?
                    {
                        stream.set_nodelay(true).map_err(Error::system_call)?;
                        drop(inner);
                        return Ok(self.finish_accept(StreamHandle::TcpStream(stream), PeerInfo::from_socket_addr(addr)));
                    }
                }
                #[cfg(unix)]
                StreamHandle::UnixListener(_) => {
                    if let Some(stream) = stream_handle
                        .try_accept_unix()
                        .map_err(Error::system_call)?
                    {
                        drop(inner);
                        return Ok(self.finish_accept(StreamHandle::UnixStream(stream), PeerInfo::empty()));
                    }
                }
                _ => return Err(Error::invalid_argument("handle is not a listener")),
            }
            drop(inner);
            thread::sleep(Duration::from_millis(crate::READINESS_POLL_MS));
        }
    }

    fn finish_accept(&self, handle: StreamHandle, peer: PeerInfo) -> Connection<C> {
        let child = Connection {
            shared: Arc::new(Shared {
                address_family: self.shared.address_family,
                inner: Mutex::new(Inner::fresh()),
                handler: Mutex::new(None),
            }),
        };
        let mut inner = child.shared.inner.lock().unwrap();
        inner.stream = Some(handle);
        inner.tcp_peer = peer;
        inner.mode.insert(Mode::TCP);
        inner.state = State::Established;
        inner.new_connection = true;
        drop(inner);
        child
    }

    /// Write `bytes` to the TCP/local-domain peer, retrying on a short
    /// write until every byte is drained. Resets the inactivity counters
    /// on success.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let active = self.shared.inner.lock().unwrap().mode.contains(Mode::TCP);
        if !active {
            return Err(Error::invalid_argument("send requires an active TCP handle"));
        }
        let mut sent = 0usize;
        while sent < bytes.len() {
            let mut inner = self.shared.inner.lock().unwrap();
            let stream = inner
                .stream
                .as_mut()
                .ok_or_else(|| Error::invalid_argument("no TCP handle"))?;
            match stream.write(&bytes[sent..]) {
                Ok(0) => return Err(Error::system_call(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "send wrote zero bytes",
                ))),
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    drop(inner);
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => return Err(Error::system_call(e)),
            }
        }
        self.reset_inactivity(&mut self.shared.inner.lock().unwrap());
        Ok(())
    }

    /// Send one UDP datagram to `addr:port`. Partial datagram writes are
    /// not retried. Resets the inactivity counters on success.
    pub fn sendto(&self, addr: &str, port: u16, bytes: &[u8]) -> Result<()> {
        let af = self.shared.address_family;
        let ip = af.parse_numeric(addr)?;
        let dest = SocketAddr::new(ip, port);
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.mode.contains(Mode::UDP) {
            return Err(Error::invalid_argument("sendto requires an active UDP handle"));
        }
        let socket = inner.udp.as_ref().ok_or_else(|| Error::invalid_argument("no UDP handle"))?;
        socket.send_to(bytes, dest).map_err(Error::system_call)?;
        self.reset_inactivity(&mut inner);
        Ok(())
    }

    fn reset_inactivity(&self, inner: &mut Inner) {
        inner.inactivity_ms = 0;
        inner.inactivity_next_call_ms = crate::INACTIVITY_TICK_MS;
    }

    /// Start the I/O worker thread for a `Connection` already holding an
    /// active handle (called automatically by `connect` and UDP `listen`;
    /// must be called explicitly for TCP/local-domain connections produced
    /// by `accept`).
    pub fn start_io(&self) -> Result<()> {
        let handler = self
            .shared
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::invalid_argument("start_io requires set_handler to run first"))?;
        let conn = self.clone();
        let builder = thread::Builder::new().name("msocket-io".into());
        let spawn_result = builder.spawn(move || worker::run(conn, handler));
        match spawn_result {
            Ok(join_handle) => {
                let mut inner = self.shared.inner.lock().unwrap();
                inner.io_worker_running = true;
                inner.worker_thread_id = Some(join_handle.thread().id());
                inner.worker_handle = Some(join_handle);
                Ok(())
            }
            Err(e) => Err(Error::system_call(e)),
        }
    }

    /// Orderly shutdown: idempotent, safe to call from any thread except
    /// this `Connection`'s own I/O worker (a self-call is detected and
    /// returns immediately without effect, avoiding a self-join deadlock).
    ///
    /// Iterates shutdown-prepare / join / handle-close until the
    /// `Connection` is quiescent, then resets every field to the `None`
    /// state.
    pub fn close(&self) -> Result<()> {
        if self.is_current_thread_the_worker() {
            return Ok(());
        }
        for _ in 0..MAX_CLOSE_ATTEMPTS {
            let (worker_running, mode_active) = {
                let mut inner = self.shared.inner.lock().unwrap();
                self.shutdown_prepare(&mut inner);
                (inner.io_worker_running, !inner.mode.is_none())
            };

            if !worker_running && !mode_active {
                let mut inner = self.shared.inner.lock().unwrap();
                *inner = Inner::fresh();
                return Ok(());
            }

            if worker_running {
                let handle = self.shared.inner.lock().unwrap().worker_handle.take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
                self.shared.inner.lock().unwrap().io_worker_running = false;
            }

            {
                let mut inner = self.shared.inner.lock().unwrap();
                if !inner.mode.is_none() {
                    if let Some(stream) = inner.stream.take() {
                        drop(stream);
                    }
                    inner.udp = None;
                    inner.mode = Mode::NONE;
                }
            }
        }
        Ok(())
    }

    fn shutdown_prepare(&self, inner: &mut Inner) {
        if matches!(inner.state, State::Pending | State::Established | State::Accepting) {
            inner.state = State::Closing;
            if inner.mode.contains(Mode::TCP) {
                if let Some(stream) = &inner.stream {
                    let _ = stream.shutdown();
                }
            }
        } else if inner.state == State::Listening {
            // A listener has no socket-level shutdown and no blocked
            // syscall to interrupt directly: `accept_loop` is itself a
            // bounded poll, so flipping the state is enough to make its
            // next iteration give up. The listening handle itself is
            // dropped a few lines below, once `mode_active` clears.
            inner.state = State::Closing;
        }
    }

    fn is_current_thread_the_worker(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        match inner.worker_thread_id {
            Some(id) => id == thread::current().id(),
            None => false,
        }
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("Connection")
            .field("address_family", &self.shared.address_family)
            .field("state", &inner.state)
            .field("mode", &inner.mode)
            .finish()
    }
}
