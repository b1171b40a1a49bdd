use crate::address::PeerInfo;
use crate::connection::Connection;
use crate::server::Server;

/// `tcp_data`'s return type: `0` means success (see `parse_len` for how much
/// was consumed), any other value is fatal to the connection.
pub type DataResult = i32;

/// The table of application callbacks a [`Connection`] or [`Server`] is
/// driven by.
///
/// Every entry is optional; an absent entry disables the corresponding
/// event silently, except `tcp_data`, whose absence means received bytes
/// accumulate in the receive buffer forever and are never parsed.
///
/// All entries are plain function pointers rather than closures, so the
/// whole table is `Copy`: [`Connection::set_handler`] takes a copy, exactly
/// as the application's opaque `context` value is handed back to every
/// call rather than captured by reference. A handler that needs to reach
/// shared state puts that state behind `context` (e.g. an `Arc<Mutex<_>>`
/// clone); the library never inspects it.
pub struct HandlerTable<C> {
    /// Invoked on the accept worker when a `Server` produces a child
    /// connection. Responsible for installing a per-child handler table
    /// and calling `start_io` on the child.
    pub tcp_accept: Option<fn(&mut C, &Server<C>, Connection<C>)>,
    /// Invoked on the I/O worker when a UDP datagram arrives.
    pub udp_msg: Option<fn(&mut C, &PeerInfo, &[u8])>,
    /// Invoked once, from the I/O worker, the first time it runs after a
    /// successful `connect` or `accept`.
    pub tcp_connected: Option<fn(&mut C, &PeerInfo)>,
    /// Invoked once, from the I/O worker, when the peer closes the
    /// connection in an orderly fashion. Never invoked after a
    /// `HandlerRejected` (non-zero `tcp_data` return).
    pub tcp_disconnected: Option<fn(&mut C)>,
    /// Invoked from the I/O worker each time the receive buffer is
    /// non-empty. Must report how many leading bytes it consumed via
    /// `parse_len`: `0` bytes means "wait for more", `n > 0` bytes means
    /// "the first `n` bytes were a complete message". Returning non-zero
    /// is fatal to the connection.
    pub tcp_data: Option<fn(ctx: &mut C, data: &[u8], parse_len: &mut usize) -> DataResult>,
    /// Invoked from the I/O worker roughly every
    /// [`crate::INACTIVITY_TICK_MS`] milliseconds of readiness-wait
    /// timeouts while established, with the cumulative elapsed idle time.
    /// Reset to zero on every successful `send`.
    pub tcp_inactivity: Option<fn(&mut C, elapsed_ms: u32)>,
}

impl<C> HandlerTable<C> {
    /// A table with every callback disabled.
    pub fn new() -> HandlerTable<C> {
        HandlerTable {
            tcp_accept: None,
            udp_msg: None,
            tcp_connected: None,
            tcp_disconnected: None,
            tcp_data: None,
            tcp_inactivity: None,
        }
    }
}

impl<C> Default for HandlerTable<C> {
    fn default() -> HandlerTable<C> {
        HandlerTable::new()
    }
}

// Manual `Clone`/`Copy` impls: `#[derive]` would require `C: Clone`/`Copy`,
// but every field is a bare `Option<fn(..)>`, which is `Copy` regardless of
// what `C` is.
impl<C> Clone for HandlerTable<C> {
    fn clone(&self) -> HandlerTable<C> {
        *self
    }
}

impl<C> Copy for HandlerTable<C> {}
