//! End-to-end scenario: close a `Connection` then `connect` it again, and
//! confirm the handler/context installed once survives for a second
//! `tcp_connected` delivery.

#[path = "support/mod.rs"]
mod support;

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;

use msocket::{AddressFamily, Connection, HandlerTable, Server};

#[test]
fn rapid_reconnect_delivers_a_second_tcp_connected() {
    support::init_logging();

    let server: Arc<Server<()>> = Server::create(AddressFamily::Inet, None);
    let mut accept_table: HandlerTable<()> = HandlerTable::new();
    accept_table.tcp_accept = Some(|_ctx, _server, child| {
        child.set_handler(HandlerTable::new(), ());
        let _ = child.start_io();
    });
    server.set_handler(accept_table, ());
    server.start(None, 0, 16003).expect("server bind");

    let (tx, rx) = channel::<()>();
    let mut client_table: HandlerTable<Sender<()>> = HandlerTable::new();
    client_table.tcp_connected = Some(|ctx, _peer| {
        let _ = ctx.send(());
    });
    let client: Connection<Sender<()>> = Connection::new(AddressFamily::Inet).unwrap();
    client.set_handler(client_table, tx);

    client.connect("127.0.0.1", 16003).expect("first connect");
    rx.recv_timeout(Duration::from_secs(2)).expect("first tcp_connected");

    client.close().expect("close");

    client.connect("127.0.0.1", 16003).expect("second connect");
    rx.recv_timeout(Duration::from_secs(2)).expect("second tcp_connected");

    client.close().expect("final close");
    server.destroy();
}
