//! End-to-end scenario: echo over TCP loopback, IPv4.

#[path = "support/mod.rs"]
mod support;

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use msocket::{AddressFamily, Connection, HandlerTable, Server};

#[derive(Debug)]
enum ServerEvent {
    Disconnected,
}

#[derive(Debug)]
enum ClientEvent {
    Connected,
    Data(Vec<u8>),
}

/// Per-child context: a clone of the server's notification channel plus a
/// back-reference to the child's own `Connection`, set once right after
/// construction, so `tcp_data` can echo without the handler table knowing
/// about the socket directly.
#[derive(Clone)]
struct EchoCtx {
    server_tx: Sender<ServerEvent>,
    handle: Arc<OnceLock<Connection<EchoCtx>>>,
}

fn echo_tcp_data_writeback(ctx: &mut EchoCtx, data: &[u8], parse_len: &mut usize) -> i32 {
    *parse_len = data.len();
    if let Some(conn) = ctx.handle.get() {
        let _ = conn.send(data);
    }
    0
}

fn echo_tcp_disconnected(ctx: &mut EchoCtx) {
    let _ = ctx.server_tx.send(ServerEvent::Disconnected);
}

#[test]
fn echo_over_tcp_loopback_ipv4() {
    support::init_logging();

    let (server_tx, server_rx) = channel::<ServerEvent>();

    let server: Arc<Server<Sender<ServerEvent>>> = Server::create(AddressFamily::Inet, None);
    let mut accept_table: HandlerTable<Sender<ServerEvent>> = HandlerTable::new();
    accept_table.tcp_accept = Some(|ctx, _server, child| {
        let handle = Arc::new(OnceLock::new());
        let _ = handle.set(child.clone());
        let echo_ctx = EchoCtx {
            server_tx: ctx.clone(),
            handle,
        };
        let mut child_table = HandlerTable::new();
        child_table.tcp_data = Some(echo_tcp_data_writeback);
        child_table.tcp_disconnected = Some(echo_tcp_disconnected);
        child.set_handler(child_table, echo_ctx);
        let _ = child.start_io();
    });
    server.set_handler(accept_table, server_tx);
    server.start(None, 0, 16001).expect("server bind");

    let (client_tx, client_rx) = channel::<ClientEvent>();
    let mut client_table: HandlerTable<Sender<ClientEvent>> = HandlerTable::new();
    client_table.tcp_connected = Some(|ctx, _peer| {
        let _ = ctx.send(ClientEvent::Connected);
    });
    client_table.tcp_data = Some(|ctx, data, parse_len| {
        *parse_len = data.len();
        let _ = ctx.send(ClientEvent::Data(data.to_vec()));
        0
    });
    let client: Connection<Sender<ClientEvent>> = Connection::new(AddressFamily::Inet).unwrap();
    client.set_handler(client_table, client_tx);
    client.connect("127.0.0.1", 16001).expect("client connect");

    match client_rx.recv_timeout(Duration::from_secs(2)) {
        Ok(ClientEvent::Connected) => {}
        other => panic!("expected Connected first, got {other:?}"),
    }

    client.send(b"hello").expect("client send");

    match client_rx.recv_timeout(Duration::from_secs(2)) {
        Ok(ClientEvent::Data(bytes)) => assert_eq!(bytes, b"hello"),
        other => panic!("expected echoed data, got {other:?}"),
    }

    client.close().expect("client close");

    server_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("tcp_disconnected must fire");
    assert!(server_rx.recv_timeout(Duration::from_millis(200)).is_err(), "no second disconnect");

    server.destroy();
}
