//! Thin end-to-end exercise of the framework's public API (§11): bind a
//! `TcpServer`, echo every received buffer back, log connect/disconnect,
//! and run the main loop. This binary adds no framework functionality of
//! its own -- it only proves the surface above is usable end to end.

use std::env;
use std::net::Ipv4Addr;
use std::sync::Arc;

use reactor_core::{Address, EventLoop, ServerOption, TcpServer};

fn get_arg(flags: &[&str]) -> Option<String> {
    env::args()
        .enumerate()
        .find_map(|(i, arg)| flags.contains(&arg.as_str()).then_some(i))
        .and_then(|idx| env::args().nth(idx + 1))
}

fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = get_arg(&["--port", "-p"]).and_then(|s| s.parse().ok()).unwrap_or(9981);
    let threads: usize = get_arg(&["--threads", "-t"]).and_then(|s| s.parse().ok()).unwrap_or(4);

    let base_loop = EventLoop::new();
    let listen_addr = Address::new(Ipv4Addr::UNSPECIFIED, port);
    let mut server = TcpServer::new(Arc::clone(&base_loop), listen_addr, "echo", ServerOption::NoReusePort);

    server.set_thread_num(threads);
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            tracing::info!(name = conn.name(), peer = %conn.peer_address(), "connection established");
        } else {
            tracing::info!(name = conn.name(), "connection closed");
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _ts| {
        let bytes = buf.retrieve_all_as_bytes();
        if let Err(e) = conn.send(&bytes) {
            tracing::warn!(name = conn.name(), error = %e, "echo send failed");
        }
    }));

    server.start();
    tracing::info!(addr = %server.local_addr(), threads, "echo server listening");

    base_loop.run();
}
