//! End-to-end scenario: UDP echo, IPv4.

#[path = "support/mod.rs"]
mod support;

use std::sync::mpsc::{channel, Sender};
use std::time::Duration;

use msocket::{AddressFamily, Connection, HandlerTable};

#[derive(Debug)]
struct Datagram {
    bytes: Vec<u8>,
    source_port: u16,
}

#[test]
fn udp_echo_ipv4() {
    support::init_logging();
    let (tx, rx) = channel::<Datagram>();

    let server: Connection<Sender<Datagram>> = Connection::new(AddressFamily::Inet).unwrap();
    let mut server_table: HandlerTable<Sender<Datagram>> = HandlerTable::new();
    server_table.udp_msg = Some(|ctx, peer, data| {
        let _ = ctx.send(Datagram {
            bytes: data.to_vec(),
            source_port: peer.port(),
        });
    });
    server.set_handler(server_table, tx);
    server.listen(msocket::Mode::UDP, 16002, None).expect("server UDP bind");

    // Port 0: the kernel assigns an ephemeral source port for the client.
    let client: Connection<()> = Connection::new(AddressFamily::Inet).unwrap();
    client.set_handler(HandlerTable::new(), ());
    client.listen(msocket::Mode::UDP, 0, None).expect("client UDP bind");
    client.sendto("127.0.0.1", 16002, b"ping").expect("sendto");

    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(datagram) => {
            assert_eq!(datagram.bytes, b"ping");
            assert_ne!(datagram.source_port, 0, "client's ephemeral port must be resolved");
        }
        Err(e) => panic!("expected a datagram: {e:?}"),
    }

    server.close().expect("server close");
    client.close().expect("client close");
}
