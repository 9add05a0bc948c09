//! End-to-end echo scenario (spec §8 "Echo"): a server bound to an
//! ephemeral loopback port echoes whatever a client sends, and closing the
//! client triggers exactly one connected->disconnected transition on the
//! server side.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use reactor_core::{Address, EventLoop, ServerOption, TcpServer};

fn running_loop() -> Arc<EventLoop> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let event_loop = EventLoop::new();
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    rx.recv().unwrap()
}

#[test]
fn echo_round_trips_and_closes_exactly_once() {
    let base_loop = running_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));

    let base_loop2 = Arc::clone(&base_loop);
    let connected2 = Arc::clone(&connected);
    let disconnected2 = Arc::clone(&disconnected);
    base_loop.run_in_loop(move || {
        let mut server = TcpServer::new(base_loop2, Address::loopback(0), "roundtrip", ServerOption::NoReusePort);
        server.set_thread_num(1);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected2.fetch_add(1, Ordering::SeqCst);
            } else {
                disconnected2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        server.set_message_callback(Arc::new(|conn, buf, _ts| {
            let bytes = buf.retrieve_all_as_bytes();
            let _ = conn.send(&bytes);
        }));
        server.start();
        addr_tx.send(server.local_addr()).unwrap();
        std::mem::forget(server);
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let mut client = TcpStream::connect(addr.to_socket_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    client.write_all(b"hello\n").unwrap();
    let mut out = [0u8; 6];
    client.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"hello\n");

    drop(client);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    base_loop.quit();
}
