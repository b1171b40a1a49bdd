//! The server accept/cleanup subsystem: an accept worker that produces
//! child [`Connection`]s and a cleanup worker that drains a
//! deferred-destruction queue, so a child can request its own teardown
//! from inside its own I/O callback without joining itself.

use std::collections::VecDeque;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::address::AddressFamily;
use crate::connection::{Connection, Mode};
use crate::error::Result;
use crate::handler::HandlerTable;
use crate::platform::Semaphore;

/// The function called by the cleanup worker to release a child
/// `Connection`. Defaults to `Connection::close` followed by dropping the
/// handle, which is the Rust counterpart of the original "delete as a
/// Connection".
pub type ChildDestructor<C> = fn(Connection<C>);

fn default_child_destructor<C: Clone + Send + 'static>(child: Connection<C>) {
    let _ = child.close();
}

struct BindParams {
    udp_addr: Option<String>,
    udp_port: u16,
    tcp_port: u16,
    #[cfg_attr(not(unix), allow(dead_code))]
    socket_path: Option<Vec<u8>>,
}

/// Owns one listening [`Connection`] plus a destructor-managed queue of
/// accepted child connections; runs an accept worker and, unless disabled,
/// a cleanup worker.
///
/// `C` is the opaque context type handed to every callback, exactly as on
/// [`Connection`].
pub struct Server<C> {
    address_family: AddressFamily,
    handler: Mutex<Option<(HandlerTable<C>, C)>>,
    child_destructor: ChildDestructor<C>,
    cleanup_enabled: bool,
    bind_params: Mutex<Option<BindParams>>,
    listening: Mutex<Option<Connection<C>>>,
    cleanup_items: Mutex<VecDeque<Connection<C>>>,
    cleanup_stop: Mutex<bool>,
    semaphore: Semaphore,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    cleanup_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clone + Send + 'static> Server<C> {
    /// Construct a `Server` with empty state. `child_destructor` defaults
    /// to [`default_child_destructor`] when `None`.
    pub fn create(address_family: AddressFamily, child_destructor: Option<ChildDestructor<C>>) -> Arc<Server<C>> {
        Arc::new(Server {
            address_family,
            handler: Mutex::new(None),
            child_destructor: child_destructor.unwrap_or(default_child_destructor::<C>),
            cleanup_enabled: true,
            bind_params: Mutex::new(None),
            listening: Mutex::new(None),
            cleanup_items: Mutex::new(VecDeque::new()),
            cleanup_stop: Mutex::new(false),
            semaphore: Semaphore::new(),
            accept_thread: Mutex::new(None),
            cleanup_thread: Mutex::new(None),
        })
    }

    /// A `Server` with no cleanup worker: `tcp_accept` and any per-child
    /// `tcp_disconnected` handler become fully responsible for child
    /// lifetimes, and `cleanup_connection` is never called internally.
    pub fn create_without_cleanup(address_family: AddressFamily, child_destructor: Option<ChildDestructor<C>>) -> Arc<Server<C>> {
        Arc::new(Server {
            address_family,
            handler: Mutex::new(None),
            child_destructor: child_destructor.unwrap_or(default_child_destructor::<C>),
            cleanup_enabled: false,
            bind_params: Mutex::new(None),
            listening: Mutex::new(None),
            cleanup_items: Mutex::new(VecDeque::new()),
            cleanup_stop: Mutex::new(false),
            semaphore: Semaphore::new(),
            accept_thread: Mutex::new(None),
            cleanup_thread: Mutex::new(None),
        })
    }

    /// Install the server-level handler table (only `tcp_accept` is
    /// meaningful) and opaque context.
    pub fn set_handler(&self, table: HandlerTable<C>, context: C) {
        *self.handler.lock().unwrap() = Some((table, context));
    }

    /// Bind an IPv4/IPv6 server: records the bind parameters then spawns
    /// the accept worker and, unless disabled, the cleanup worker.
    ///
    /// `udp_port == 0` disables UDP; `tcp_port == 0` disables TCP.
    pub fn start(self: &Arc<Self>, udp_addr: Option<&str>, udp_port: u16, tcp_port: u16) -> Result<()> {
        *self.bind_params.lock().unwrap() = Some(BindParams {
            udp_addr: udp_addr.map(String::from),
            udp_port,
            tcp_port,
            socket_path: None,
        });
        self.spawn_workers()
    }

    /// Bind a local-domain server at `path` (leading NUL byte selects the
    /// abstract namespace).
    #[cfg(unix)]
    pub fn unix_start(self: &Arc<Self>, path: &[u8]) -> Result<()> {
        *self.bind_params.lock().unwrap() = Some(BindParams {
            udp_addr: None,
            udp_port: 0,
            tcp_port: 0,
            socket_path: Some(path.to_vec()),
        });
        self.spawn_workers()
    }

    fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        let accept_server = self.clone();
        let builder = thread::Builder::new().name("msocket-accept".into());
        let handle = builder
            .spawn(move || accept_server.accept_worker())
            .map_err(crate::error::Error::system_call)?;
        *self.accept_thread.lock().unwrap() = Some(handle);

        if self.cleanup_enabled {
            let cleanup_server = self.clone();
            let builder = thread::Builder::new().name("msocket-cleanup".into());
            let handle = builder
                .spawn(move || cleanup_server.cleanup_worker())
                .map_err(crate::error::Error::system_call)?;
            *self.cleanup_thread.lock().unwrap() = Some(handle);
        }
        Ok(())
    }

    fn accept_worker(self: Arc<Self>) {
        let listener: Connection<C> = match Connection::new(self.address_family) {
            Ok(c) => c,
            Err(e) => {
                error!("msocket: failed to allocate the listening connection: {e}");
                return;
            }
        };

        let params = {
            let guard = self.bind_params.lock().unwrap();
            match guard.as_ref() {
                Some(p) => (p.udp_addr.clone(), p.udp_port, p.tcp_port, p.socket_path.clone()),
                None => {
                    error!("msocket: accept worker started before start/unix_start");
                    return;
                }
            }
        };
        let (udp_addr, udp_port, tcp_port, socket_path) = params;

        if udp_port != 0 {
            if let Some((table, context)) = self.handler.lock().unwrap().clone() {
                listener.set_handler(table, context);
            }
            if let Err(e) = listener.listen(Mode::UDP, udp_port, udp_addr.as_deref()) {
                error!("msocket: server failed to bind UDP port {udp_port}: {e}");
                return;
            }
        }
        if tcp_port != 0 {
            if let Err(e) = listener.listen(Mode::TCP, tcp_port, None) {
                error!("msocket: server failed to bind TCP port {tcp_port}: {e}");
                return;
            }
        }
        #[cfg(unix)]
        if let Some(path) = socket_path.as_deref() {
            if let Err(e) = listener.unix_listen(path) {
                error!("msocket: server failed to bind local-domain path: {e}");
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = socket_path;

        if tcp_port == 0 && socket_path_is_none(&socket_path) {
            // UDP-only server: there is nothing to accept. The listening
            // Connection stays alive (and bound) until destroy() closes it.
            *self.listening.lock().unwrap() = Some(listener);
            return;
        }

        *self.listening.lock().unwrap() = Some(listener.clone());

        loop {
            match listener.accept() {
                Ok(child) => {
                    let mut handler = self.handler.lock().unwrap();
                    if let Some((table, context)) = handler.as_mut() {
                        if let Some(cb) = table.tcp_accept {
                            cb(context, self.as_ref(), child);
                        }
                    }
                }
                Err(e) => {
                    debug!("msocket: accept worker stopping: {e}");
                    break;
                }
            }
        }

        let _ = listener.close();
    }

    fn cleanup_worker(self: Arc<Self>) {
        loop {
            let acquired = self.semaphore.try_wait(Duration::from_millis(crate::CLEANUP_POLL_MS));
            if acquired {
                let item = self.cleanup_items.lock().unwrap().pop_front();
                if let Some(child) = item {
                    (self.child_destructor)(child);
                }
                continue;
            }
            if *self.cleanup_stop.lock().unwrap() {
                break;
            }
        }
    }

    /// Append `child` to the deferred-destruction queue and wake the
    /// cleanup worker. This is how a per-child `tcp_disconnected` handler
    /// requests its own teardown without blocking or joining itself.
    pub fn cleanup_connection(&self, child: Connection<C>) {
        if *self.cleanup_stop.lock().unwrap() {
            warn!("msocket: cleanup_connection called after server teardown began");
            return;
        }
        self.cleanup_items.lock().unwrap().push_back(child);
        self.semaphore.post();
    }

    /// Join an IPv6 multicast group on the server's bound UDP socket, if
    /// one is active.
    pub fn join_multicast_v6(&self, group: Ipv6Addr) -> Result<()> {
        let listening = self.listening.lock().unwrap();
        match listening.as_ref() {
            Some(conn) => conn.join_multicast_v6(group),
            None => Err(crate::error::Error::invalid_argument("server has no listening connection yet")),
        }
    }

    /// Stop accepting, join both worker threads, and release every
    /// resource: sets `cleanup_stop`, closes the listening `Connection`
    /// (which unblocks the accept worker's blocked `accept`), joins the
    /// accept worker, then (if enabled) joins the cleanup worker. Unlinks
    /// a non-abstract local-domain socket path.
    pub fn destroy(&self) {
        *self.cleanup_stop.lock().unwrap() = true;

        if let Some(listener) = self.listening.lock().unwrap().as_ref() {
            let _ = listener.close();
        }

        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if self.cleanup_enabled {
            if let Some(handle) = self.cleanup_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }

        self.cleanup_items.lock().unwrap().clear();
        *self.listening.lock().unwrap() = None;

        #[cfg(unix)]
        if let Some(params) = self.bind_params.lock().unwrap().as_ref() {
            if let Some(path) = params.socket_path.as_deref() {
                crate::platform::unix_path::unlink_if_path(path);
            }
        }
    }
}

fn socket_path_is_none(path: &Option<Vec<u8>>) -> bool {
    path.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_has_no_listening_connection_yet() {
        let server: Arc<Server<()>> = Server::create(AddressFamily::Inet, None);
        assert!(server.listening.lock().unwrap().is_none());
    }

    #[test]
    fn destroy_before_start_is_harmless() {
        let server: Arc<Server<()>> = Server::create(AddressFamily::Inet, None);
        server.destroy();
    }
}
