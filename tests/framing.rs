//! End-to-end scenarios: length-prefixed message framing, and a frame
//! split across two TCP writes.

#[path = "support/mod.rs"]
mod support;

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::Duration;

use msocket::{AddressFamily, Connection, HandlerTable, Server};

#[derive(Debug)]
enum FrameEvent {
    Insufficient,
    Frame(Vec<u8>),
}

/// A 4-byte big-endian length prefix followed by that many payload bytes.
fn frame_tcp_data(ctx: &mut Sender<FrameEvent>, data: &[u8], parse_len: &mut usize) -> i32 {
    if data.len() < 4 {
        *parse_len = 0;
        let _ = ctx.send(FrameEvent::Insufficient);
        return 0;
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let total = 4 + len;
    if data.len() < total {
        *parse_len = 0;
        let _ = ctx.send(FrameEvent::Insufficient);
        return 0;
    }
    *parse_len = total;
    let _ = ctx.send(FrameEvent::Frame(data[4..total].to_vec()));
    0
}

#[test]
fn framed_parsing_two_messages_in_one_write() {
    support::init_logging();
    let (tx, rx) = channel::<FrameEvent>();

    let server: Arc<Server<Sender<FrameEvent>>> = Server::create(AddressFamily::Inet, None);
    let mut accept_table: HandlerTable<Sender<FrameEvent>> = HandlerTable::new();
    accept_table.tcp_accept = Some(|ctx, _server, child| {
        let mut child_table = HandlerTable::new();
        child_table.tcp_data = Some(frame_tcp_data);
        child.set_handler(child_table, ctx.clone());
        let _ = child.start_io();
    });
    server.set_handler(accept_table, tx);
    server.start(None, 0, 16010).expect("server bind");

    let client: Connection<()> = Connection::new(AddressFamily::Inet).unwrap();
    client.set_handler(HandlerTable::new(), ());
    client.connect("127.0.0.1", 16010).expect("client connect");

    let payload = b"\x00\x00\x00\x03abc\x00\x00\x00\x02de";
    client.send(payload).expect("client send");

    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(FrameEvent::Frame(bytes)) => assert_eq!(bytes, b"abc"),
        other => panic!("expected first frame, got {other:?}"),
    }
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(FrameEvent::Frame(bytes)) => assert_eq!(bytes, b"de"),
        other => panic!("expected second frame, got {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "exactly two frames, no more");

    client.close().expect("client close");
    server.destroy();
}

#[test]
fn partial_frame_split_across_two_writes() {
    support::init_logging();
    let (tx, rx) = channel::<FrameEvent>();

    let server: Arc<Server<Sender<FrameEvent>>> = Server::create(AddressFamily::Inet, None);
    let mut accept_table: HandlerTable<Sender<FrameEvent>> = HandlerTable::new();
    accept_table.tcp_accept = Some(|ctx, _server, child| {
        let mut child_table = HandlerTable::new();
        child_table.tcp_data = Some(frame_tcp_data);
        child.set_handler(child_table, ctx.clone());
        let _ = child.start_io();
    });
    server.set_handler(accept_table, tx);
    server.start(None, 0, 16011).expect("server bind");

    let client: Connection<()> = Connection::new(AddressFamily::Inet).unwrap();
    client.set_handler(HandlerTable::new(), ());
    client.connect("127.0.0.1", 16011).expect("client connect");

    // "ab" out of a 5-byte payload the prefix promises.
    client.send(b"\x00\x00\x00\x05ab").expect("first write");

    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(FrameEvent::Insufficient) => {}
        other => panic!("expected Insufficient on the first write, got {other:?}"),
    }

    std::thread::sleep(Duration::from_millis(100));
    client.send(b"cde").expect("second write");

    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(FrameEvent::Frame(bytes)) => assert_eq!(bytes, b"abcde"),
        other => panic!("expected the completed frame, got {other:?}"),
    }

    client.close().expect("client close");
    server.destroy();
}
