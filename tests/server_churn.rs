//! End-to-end scenario: 50 sequential client connections, each sending one
//! byte then closing; the configured child destructor must run exactly 50
//! times and the cleanup queue must end up empty.

#[path = "support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use msocket::{AddressFamily, Connection, HandlerTable, Server};

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

/// Per-child context: the server this child belongs to (to push itself
/// onto the cleanup queue), a back-reference to its own handle (set once
/// right after construction), and a channel the test blocks on to know a
/// disconnect has been queued for cleanup.
#[derive(Clone)]
struct ChurnCtx {
    server: Arc<Server<ChurnCtx>>,
    handle: Arc<OnceLock<Connection<ChurnCtx>>>,
    queued_tx: Sender<()>,
}

fn on_child_data(_ctx: &mut ChurnCtx, data: &[u8], parse_len: &mut usize) -> i32 {
    *parse_len = data.len();
    0
}

fn on_child_disconnected(ctx: &mut ChurnCtx) {
    if let Some(conn) = ctx.handle.get() {
        ctx.server.cleanup_connection(conn.clone());
    }
    let _ = ctx.queued_tx.send(());
}

fn counting_destructor(child: Connection<ChurnCtx>) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
    let _ = child.close();
}

#[test]
fn server_cleanup_under_churn_of_fifty_connections() {
    support::init_logging();

    let (queued_tx, queued_rx) = channel::<()>();

    let server: Arc<Server<ChurnCtx>> = Server::create(AddressFamily::Inet, Some(counting_destructor));
    let mut accept_table: HandlerTable<ChurnCtx> = HandlerTable::new();
    accept_table.tcp_accept = Some(|ctx, _server, child| {
        let handle = Arc::new(OnceLock::new());
        let _ = handle.set(child.clone());
        let child_ctx = ChurnCtx {
            server: ctx.server.clone(),
            handle,
            queued_tx: ctx.queued_tx.clone(),
        };
        let mut child_table = HandlerTable::new();
        child_table.tcp_data = Some(on_child_data);
        child_table.tcp_disconnected = Some(on_child_disconnected);
        child.set_handler(child_table, child_ctx);
        let _ = child.start_io();
    });
    let root_ctx = ChurnCtx {
        server: server.clone(),
        handle: Arc::new(OnceLock::new()),
        queued_tx,
    };
    server.set_handler(accept_table, root_ctx);
    server.start(None, 0, 16020).expect("server bind");

    for _ in 0..50 {
        let client: Connection<()> = Connection::new(AddressFamily::Inet).unwrap();
        client.set_handler(HandlerTable::new(), ());
        client.connect("127.0.0.1", 16020).expect("client connect");
        client.send(&[0u8]).expect("client send");
        client.close().expect("client close");
    }

    for _ in 0..50 {
        queued_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("every child must report its disconnect before destroy");
    }

    server.destroy();

    assert_eq!(DESTROYED.load(Ordering::SeqCst), 50, "destructor must run exactly once per child");
}
