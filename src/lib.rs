//! Event-driven socket library over TCP, UDP and local-domain stream sockets.
//!
//! Application code builds a [`HandlerTable`] of callbacks and hands it to a
//! [`Connection`] (for a single socket) or a [`Server`] (for a listening
//! endpoint plus its accepted children). A dedicated I/O worker thread per
//! `Connection` drives readiness waits, receive buffering, message framing
//! and the inactivity timer, and invokes the installed callbacks
//! synchronously on that thread.
//!
//! # Example
//!
//! ```no_run
//! use msocket::{Connection, AddressFamily, HandlerTable};
//!
//! let mut handlers = HandlerTable::new();
//! handlers.tcp_data = Some(|_ctx, data, parse_len| {
//!     *parse_len = data.len();
//!     0
//! });
//!
//! let conn = Connection::new(AddressFamily::Inet).unwrap();
//! conn.set_handler(handlers, 0);
//! conn.connect("127.0.0.1", 7000).unwrap();
//! ```
//!
//! See [`Server`] for the accept/cleanup half of the library.

#![warn(missing_docs)]

mod address;
mod buffer;
mod error;
mod handler;
mod platform;

pub mod connection;
pub mod server;

pub use address::{AddressFamily, PeerInfo};
pub use buffer::RecvBuffer;
pub use connection::{Connection, Mode, State};
pub use error::{Error, ErrorKind, Result};
pub use handler::HandlerTable;
pub use server::Server;

/// TCP/UDP receive scratch buffer size, and the receive buffer's grow chunk
/// size: both fixed at 8 KiB per the wire contract.
pub const RCV_BUF_GROW_SIZE: usize = 8 * 1024;
/// Minimum initial capacity of a [`RecvBuffer`].
pub const MIN_RCV_BUF_SIZE: usize = RCV_BUF_GROW_SIZE;
/// Backlog passed to the kernel `listen` call for TCP and local-domain
/// listeners.
pub const LISTEN_BACKLOG: i32 = 5;
/// Readiness-wait timeout used by every `Connection`'s I/O worker.
pub const READINESS_POLL_MS: u64 = 50;
/// Polling interval used by a `Server`'s cleanup worker while waiting on the
/// destruction semaphore.
pub const CLEANUP_POLL_MS: u64 = 200;
/// Granularity at which `tcp_inactivity` is invoked, in milliseconds.
pub const INACTIVITY_TICK_MS: u32 = 1000;
/// Lower bound on the number of attempts `Connection::close` makes before
/// giving up on a worker that refuses to quiesce.
pub const MAX_CLOSE_ATTEMPTS: u8 = 20;
