//! Minimal chat-over-TCP server: accepts one client at a time, prints
//! whatever it receives, and forwards each line typed on stdin to the
//! currently connected client.
//!
//! ```text
//! $ cargo run --example echo_server -- -p 7000
//! ```

use std::env;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, OnceLock};

use msocket::{AddressFamily, Connection, HandlerTable, Server};

#[derive(Clone)]
struct ServerCtx {
    client: Arc<Mutex<Option<Connection<ClientCtx>>>>,
}

#[derive(Clone)]
struct ClientCtx {
    handle: Arc<OnceLock<Connection<ClientCtx>>>,
    client_slot: Arc<Mutex<Option<Connection<ClientCtx>>>>,
}

fn tcp_accept(ctx: &mut ServerCtx, _server: &Server<ServerCtx>, child: Connection<ClientCtx>) {
    println!("[SERVER] connection accepted");
    let handle = Arc::new(OnceLock::new());
    let _ = handle.set(child.clone());
    let child_ctx = ClientCtx {
        handle,
        client_slot: ctx.client.clone(),
    };

    let mut table = HandlerTable::new();
    table.tcp_data = Some(tcp_data);
    table.tcp_disconnected = Some(tcp_disconnected);
    child.set_handler(table, child_ctx);
    let _ = child.start_io();

    *ctx.client.lock().unwrap() = Some(child);
}

fn tcp_data(_ctx: &mut ClientCtx, data: &[u8], parse_len: &mut usize) -> i32 {
    *parse_len = data.len();
    println!("[SERVER] got {} bytes of data", data.len());
    0
}

fn tcp_disconnected(ctx: &mut ClientCtx) {
    println!("[SERVER] client connection lost");
    ctx.client_slot.lock().unwrap().take();
}

fn print_usage() {
    eprintln!("echo_server -p<port>");
}

fn parse_port(args: &[String]) -> Option<u16> {
    args.iter().find_map(|arg| {
        arg.strip_prefix("-p=")
            .or_else(|| arg.strip_prefix("-p"))
            .and_then(|num| num.parse().ok())
    })
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(port) = parse_port(&args) else {
        print_usage();
        return;
    };

    println!("[SERVER] starting server on port {port}");

    let server: Arc<Server<ServerCtx>> = Server::create(AddressFamily::Inet, None);
    let mut table: HandlerTable<ServerCtx> = HandlerTable::new();
    table.tcp_accept = Some(tcp_accept);
    let client = Arc::new(Mutex::new(None));
    server.set_handler(table, ServerCtx { client: client.clone() });
    server
        .start(None, 0, port)
        .expect("failed to bind server port");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match client.lock().unwrap().as_ref() {
            Some(conn) => {
                let mut message = line;
                message.push('\n');
                let _ = conn.send(message.as_bytes());
            }
            None => println!("[SERVER] no client connected"),
        }
    }

    server.destroy();
}
