//! Back-pressure and graceful-shutdown scenarios (spec §8): a `send` that
//! would cross the high-water mark fires the callback exactly once, and
//! `shutdown()` against a slow reader only half-closes the write side once
//! every buffered byte has actually drained.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
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

/// A payload large enough that even a generous kernel send buffer can't
/// absorb it in a single direct `write`, so the remainder reliably lands in
/// `output_buffer` and crosses a 1 KiB high-water mark.
const BACK_PRESSURE_PAYLOAD: usize = 4 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 1024;

#[test]
fn high_water_mark_fires_exactly_once_with_a_non_reading_peer() {
    let base_loop = running_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();
    let hits = Arc::new(Mutex::new(Vec::<usize>::new()));

    let base_loop2 = Arc::clone(&base_loop);
    let hits2 = Arc::clone(&hits);
    base_loop.run_in_loop(move || {
        let mut server = TcpServer::new(base_loop2, Address::loopback(0), "backpressure", ServerOption::NoReusePort);
        server.set_thread_num(1);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let _ = conn_tx.send(Arc::clone(conn));
            }
        }));
        server.set_high_water_mark_callback(
            Arc::new(move |_conn, size| hits2.lock().unwrap().push(size)),
            HIGH_WATER_MARK,
        );
        server.start();
        addr_tx.send(server.local_addr()).unwrap();
        std::mem::forget(server);
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // Never read from this client -- the whole point is to force the
    // server's socket buffer to fill up and back-pressure to build.
    let _client = TcpStream::connect(addr.to_socket_addr()).unwrap();

    let conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let _ = conn.send(&vec![b'x'; BACK_PRESSURE_PAYLOAD]);

    thread::sleep(Duration::from_millis(200));
    let fired = hits.lock().unwrap().clone();
    assert_eq!(fired.len(), 1, "high-water callback should fire exactly once, got {fired:?}");
    assert!(fired[0] >= HIGH_WATER_MARK, "projected size {} should be >= the high-water mark", fired[0]);

    base_loop.quit();
}

#[test]
fn shutdown_drains_pending_output_before_half_closing() {
    let base_loop = running_loop();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();

    let base_loop2 = Arc::clone(&base_loop);
    base_loop.run_in_loop(move || {
        let mut server = TcpServer::new(base_loop2, Address::loopback(0), "shutdown", ServerOption::NoReusePort);
        server.set_thread_num(1);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let _ = conn_tx.send(Arc::clone(conn));
            }
        }));
        server.start();
        addr_tx.send(server.local_addr()).unwrap();
        std::mem::forget(server);
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let mut client = TcpStream::connect(addr.to_socket_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let conn = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    const PAYLOAD: usize = 1024 * 1024;
    let _ = conn.send(&vec![b'y'; PAYLOAD]);
    // Give the server a moment to start queueing against the not-yet-reading
    // client, so shutdown() races a genuinely non-empty output buffer.
    thread::sleep(Duration::from_millis(50));
    let _ = conn.shutdown();

    let total_read = Arc::new(AtomicUsize::new(0));
    let total_read2 = Arc::clone(&total_read);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16384];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total_read2.fetch_add(n, Ordering::SeqCst);
                }
                Err(e) => panic!("client read failed: {e}"),
            }
        }
    });
    reader.join().unwrap();

    assert_eq!(total_read.load(Ordering::SeqCst), PAYLOAD, "client must see every byte before EOF");

    base_loop.quit();
}
