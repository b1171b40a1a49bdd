//! The per-`Connection` I/O worker: a single dedicated thread that is the
//! sole reader of the socket and the sole writer of the receive buffer. It
//! never re-enters a handler callback on itself and never closes its own
//! socket handle.

use std::io;
use std::time::Duration;

use log::{debug, trace, warn};
use mio::{Events, Interest, Poll, Token};

use super::{Connection, Mode, State};
use crate::buffer::RecvBuffer;
use crate::handler::HandlerTable;

const TOKEN: Token = Token(0);

pub(super) fn run<C: Clone + Send + 'static>(conn: Connection<C>, handler: (HandlerTable<C>, C)) {
    let (table, mut context) = handler;

    let new_connection = {
        let mut inner = conn.shared.inner.lock().unwrap();
        let was_new = inner.new_connection;
        inner.new_connection = false;
        was_new
    };
    if new_connection {
        if let Some(cb) = table.tcp_connected {
            let peer = conn.peer_addr();
            cb(&mut context, &peer);
        }
    }

    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            warn!("msocket: failed to create readiness poll for I/O worker: {e}");
            return;
        }
    };

    let udp_active = conn.shared.inner.lock().unwrap().mode.contains(Mode::UDP);
    let registration = {
        let mut inner = conn.shared.inner.lock().unwrap();
        if udp_active {
            inner
                .udp
                .as_mut()
                .map(|s| poll.registry().register(s, TOKEN, Interest::READABLE))
        } else {
            inner
                .stream
                .as_mut()
                .map(|s| s.register(poll.registry(), TOKEN, Interest::READABLE | Interest::WRITABLE))
        }
    };
    match registration {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            warn!("msocket: failed to register I/O worker's handle: {e}");
            return;
        }
        None => {
            warn!("msocket: I/O worker started with no active handle");
            return;
        }
    }

    let mut events = Events::with_capacity(4);
    let mut rx_buffer = RecvBuffer::new();
    let mut scratch = vec![0u8; crate::RCV_BUF_GROW_SIZE];

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(crate::READINESS_POLL_MS))) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("msocket: readiness poll failed: {e}");
            break;
        }

        if events.iter().next().is_none() {
            if conn.state() == State::Closing {
                break;
            }
            if conn.state() == State::Established {
                tick_inactivity(&conn, &table, &mut context);
            }
            continue;
        }

        if udp_active {
            if !drain_udp(&conn, &table, &mut context, &mut scratch) {
                break 'outer;
            }
        } else {
            match drain_tcp(&conn, &table, &mut context, &mut scratch, &mut rx_buffer) {
                DrainOutcome::Continue => {}
                DrainOutcome::HandlerRejected => {
                    conn.shared.inner.lock().unwrap().state = State::Closing;
                    break 'outer;
                }
                DrainOutcome::Disconnected | DrainOutcome::Fatal => {
                    break 'outer;
                }
            }
        }
    }

    trace!("msocket: I/O worker exiting");
}

fn tick_inactivity<C>(conn: &Connection<C>, table: &HandlerTable<C>, context: &mut C) {
    let fired = {
        let mut inner = conn.shared.inner.lock().unwrap();
        inner.inactivity_ms += crate::READINESS_POLL_MS as u32;
        if inner.inactivity_ms >= inner.inactivity_next_call_ms {
            inner.inactivity_next_call_ms += crate::INACTIVITY_TICK_MS;
            Some(inner.inactivity_ms)
        } else {
            None
        }
    };
    if let Some(elapsed) = fired {
        if let Some(cb) = table.tcp_inactivity {
            cb(context, elapsed);
        }
    }
}

/// Read and dispatch one UDP readiness event, draining the socket to
/// `WouldBlock` since mio registers interest edge-triggered. Returns
/// `false` if the worker should exit.
fn drain_udp<C>(
    conn: &Connection<C>,
    table: &HandlerTable<C>,
    context: &mut C,
    scratch: &mut [u8],
) -> bool {
    loop {
        let read = {
            let inner = conn.shared.inner.lock().unwrap();
            match &inner.udp {
                Some(socket) => socket.recv_from(scratch),
                None => return false,
            }
        };
        match read {
            Ok((len, from)) => {
                let peer = crate::address::PeerInfo::from_socket_addr(from);
                {
                    let mut inner = conn.shared.inner.lock().unwrap();
                    inner.udp_last_sender = peer.clone();
                }
                if let Some(cb) = table.udp_msg {
                    cb(context, &peer, &scratch[..len]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                warn!("msocket: UDP receive failed: {e}");
                return false;
            }
        }
    }
}

enum DrainOutcome {
    Continue,
    HandlerRejected,
    Disconnected,
    Fatal,
}

/// Read and dispatch one TCP/local-domain readiness event, draining to
/// `WouldBlock`, running the framing inner loop after every successful
/// read.
fn drain_tcp<C>(
    conn: &Connection<C>,
    table: &HandlerTable<C>,
    context: &mut C,
    scratch: &mut [u8],
    rx_buffer: &mut RecvBuffer,
) -> DrainOutcome {
    loop {
        let read = {
            let mut inner = conn.shared.inner.lock().unwrap();
            match inner.stream.as_mut() {
                Some(stream) => stream.read(scratch),
                None => return DrainOutcome::Fatal,
            }
        };
        match read {
            Ok(0) => {
                deliver_disconnect(conn, table, context);
                return DrainOutcome::Disconnected;
            }
            Ok(n) => {
                if rx_buffer.append(&scratch[..n]).is_err() {
                    warn!("msocket: out of memory growing receive buffer");
                    return DrainOutcome::Fatal;
                }
                match run_framing_loop(table, context, rx_buffer) {
                    DrainOutcome::Continue => {}
                    other => return other,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DrainOutcome::Continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                deliver_disconnect(conn, table, context);
                return DrainOutcome::Disconnected;
            }
            Err(e) => {
                debug!("msocket: TCP receive failed: {e}");
                return DrainOutcome::Fatal;
            }
        }
    }
}

fn deliver_disconnect<C>(conn: &Connection<C>, table: &HandlerTable<C>, context: &mut C) {
    let already_closing = {
        let mut inner = conn.shared.inner.lock().unwrap();
        let was_closing = inner.state == State::Closing;
        inner.state = State::Closing;
        was_closing
    };
    if !already_closing {
        if let Some(cb) = table.tcp_disconnected {
            cb(context);
        }
    }
}

/// The framing inner loop: re-invoke `tcp_data` while the receive buffer is
/// non-empty, until the handler reports "not enough bytes yet" or rejects
/// the data outright.
fn run_framing_loop<C>(table: &HandlerTable<C>, context: &mut C, rx_buffer: &mut RecvBuffer) -> DrainOutcome {
    let Some(tcp_data) = table.tcp_data else {
        return DrainOutcome::Continue;
    };
    while !rx_buffer.is_empty() {
        let mut parse_len = 0usize;
        let rc = tcp_data(context, rx_buffer.data(), &mut parse_len);
        if rc != 0 {
            return DrainOutcome::HandlerRejected;
        }
        if parse_len == 0 {
            break;
        }
        assert!(parse_len <= rx_buffer.length(), "tcp_data consumed more than it was given");
        rx_buffer.trim_left(parse_len);
    }
    DrainOutcome::Continue
}
