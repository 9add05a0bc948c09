//! A single accepted (or about-to-be-destroyed) TCP connection and its
//! state machine (§4.6). Grounded in `original_source/src/TcpConnection.cc`;
//! the shared-ownership + weak-tie lifetime scheme is carried over from the
//! `Channel`'s weak tie (§9's design note) rather than reproducing
//! `enable_shared_from_this`, which Rust has no direct analogue of.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::address::Address;
use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// 64 MiB, matching the original's `kHighWaterMark` default (§3).
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// `state_`'s four values (§3/§4.6). Transitions only ever move forward:
/// `Connecting -> Connected -> {Disconnecting ->} Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Owned jointly by the server's connection table and any in-flight event
/// handler (§3). All mutation happens on `event_loop`'s own thread; `send`
/// and `shutdown` are the only methods a foreign thread may call directly,
/// and both immediately hand off via `run_in_loop`/`queue_in_loop`.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: RefCell<mio::net::TcpStream>,
    channel: Rc<RefCell<Channel>>,
    local_addr: Address,
    peer_addr: Address,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
    high_water_cb: RefCell<Option<HighWaterMarkCallback>>,
    high_water_mark: std::cell::Cell<usize>,
    reading: std::cell::Cell<bool>,
    self_weak: Weak<TcpConnection>,
}

// SAFETY: every field other than `event_loop`/`name`/`local_addr`/
// `peer_addr` (all immutable after construction, or themselves internally
// synchronized) is only ever mutated from `event_loop`'s owning thread --
// the same affinity contract `EventLoop` itself relies on for its manual
// `Send`/`Sync` impls. `state` is the one field read from arbitrary threads
// (via `connected()`), hence the `AtomicU8` rather than a `Cell`.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    /// Constructs a connection bound to `event_loop`, in the `Connecting`
    /// state (§4.6). Installs the channel's four callbacks as weak closures
    /// back into `self` -- weak, not strong, so the channel (owned by this
    /// connection) never keeps the connection itself alive through a
    /// reference cycle; the short-lived strong upgrade happens inside each
    /// closure, same as the channel's own tie-upgrade-for-dispatch pattern.
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        stream: mio::net::TcpStream,
        local_addr: Address,
        peer_addr: Address,
    ) -> Arc<TcpConnection> {
        event_loop.assert_in_loop_thread();
        crate::socket::set_keepalive(&stream, true);
        let fd = stream.as_raw_fd();
        let channel = Channel::bind(&event_loop, fd);

        Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            {
                let mut ch = channel.borrow_mut();
                let w = Weak::clone(weak);
                ch.set_read_callback(move |ts| {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_read(ts);
                    }
                });
                let w = Weak::clone(weak);
                ch.set_write_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_write();
                    }
                });
                let w = Weak::clone(weak);
                ch.set_close_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_close();
                    }
                });
                let w = Weak::clone(weak);
                ch.set_error_callback(move || {
                    if let Some(conn) = w.upgrade() {
                        conn.handle_error();
                    }
                });
            }

            tracing::info!(name = %name, fd, "TcpConnection constructed");

            TcpConnection {
                event_loop,
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                socket: RefCell::new(stream),
                channel,
                local_addr,
                peer_addr,
                input_buffer: RefCell::new(Buffer::new()),
                output_buffer: RefCell::new(Buffer::new()),
                connection_cb: RefCell::new(None),
                message_cb: RefCell::new(None),
                write_complete_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
                high_water_cb: RefCell::new(None),
                high_water_mark: std::cell::Cell::new(DEFAULT_HIGH_WATER_MARK),
                reading: std::cell::Cell::new(false),
                self_weak: Weak::clone(weak),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> &Address {
        &self.local_addr
    }

    pub fn peer_address(&self) -> &Address {
        &self.peer_addr
    }

    pub fn get_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.event_loop)
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn arc(&self) -> Arc<TcpConnection> {
        self.self_weak.upgrade().expect("TcpConnection dispatched while not kept alive")
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.borrow_mut() = Some(cb);
        self.high_water_mark.set(mark);
    }

    /// Transitions `Connecting -> Connected`, ties the channel to `self`,
    /// enables reading, fires the connection callback (§4.6). Posted onto
    /// `event_loop` by `TcpServer::new_connection` right after construction.
    pub fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(ConnState::Connected);
        let conn = self.arc();
        {
            let mut ch = self.channel.borrow_mut();
            let tie: Weak<dyn std::any::Any + Send + Sync> = Arc::downgrade(&conn);
            ch.set_tie(tie);
            ch.enable_reading(&self.event_loop);
        }
        self.reading.set(true);
        if let Some(cb) = self.connection_cb.borrow().clone() {
            cb(&conn);
        }
    }

    /// Posted when the server removes this connection from its table
    /// (§4.6). Unconditionally removes the channel from the poller
    /// regardless of starting state.
    pub fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.borrow_mut().disable_all(&self.event_loop);
            if let Some(cb) = self.connection_cb.borrow().clone() {
                let conn = self.arc();
                cb(&conn);
            }
        }
        self.channel.borrow_mut().remove(&self.event_loop);
    }

    fn handle_read(self: Arc<Self>, ts: Timestamp) {
        let result = {
            let mut stream = self.socket.borrow_mut();
            let mut input = self.input_buffer.borrow_mut();
            input.read_from(&mut *stream)
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                let cb = self.message_cb.borrow().clone();
                if let Some(cb) = cb {
                    cb(&self, &mut self.input_buffer.borrow_mut(), ts);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "TcpConnection::handle_read");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: Arc<Self>) {
        if !self.channel.borrow().is_writing() {
            tracing::error!(name = %self.name, "TcpConnection fd is down, no more writing");
            return;
        }
        let result = {
            let mut stream = self.socket.borrow_mut();
            let mut output = self.output_buffer.borrow_mut();
            let n = output.write_to(&mut *stream);
            if let Ok(n) = n {
                output.retrieve(n);
            }
            n
        };
        match result {
            Ok(_n) => {
                if self.output_buffer.borrow().is_empty() {
                    self.channel.borrow_mut().disable_writing(&self.event_loop);
                    if let Some(cb) = self.write_complete_cb.borrow().clone() {
                        let conn = Arc::clone(&self);
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => tracing::error!(name = %self.name, error = %e, "TcpConnection::handle_write"),
        }
    }

    /// `handle_close` (§4.6): state goes to `Disconnected` *before* either
    /// callback fires, so `connectionCallback_`'s `connected()` already
    /// reads false -- the open question §9 calls out explicitly.
    fn handle_close(self: Arc<Self>) {
        tracing::info!(name = %self.name, "TcpConnection::handle_close");
        self.set_state(ConnState::Disconnected);
        self.channel.borrow_mut().disable_all(&self.event_loop);

        if let Some(cb) = self.connection_cb.borrow().clone() {
            cb(&self);
        }
        if let Some(cb) = self.close_cb.borrow().clone() {
            cb(&self);
        }
    }

    fn handle_error(&self) {
        let err = crate::socket::take_so_error(&self.socket.borrow());
        tracing::error!(name = %self.name, error = %err, "TcpConnection::handle_error");
    }

    /// `send` (§4.6's Public API): inline if already on the owning loop's
    /// thread, otherwise copies the bytes and posts `send_in_loop`. A send
    /// outside `Connected` is the "post-condition violation" tier of §7 --
    /// error-logged, not fatal, and reported back to the caller rather than
    /// silently dropped.
    pub fn send(&self, data: &[u8]) -> crate::error::Result<()> {
        if self.state() != ConnState::Connected {
            tracing::error!(name = %self.name, state = ?self.state(), "send on a connection that is not connected");
            return Err(crate::error::ReactorError::NotConnected);
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let conn = self.arc();
            self.event_loop.queue_in_loop(move || conn.send_in_loop(&owned));
        }
        Ok(())
    }

    fn send_in_loop(&self, data: &[u8]) {
        let mut written = 0usize;
        let mut fault = false;

        if !self.channel.borrow().is_writing() && self.output_buffer.borrow().is_empty() {
            let rc = {
                let mut stream = self.socket.borrow_mut();
                io::Write::write(&mut *stream, data)
            };
            match rc {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        if let Some(cb) = self.write_complete_cb.borrow().clone() {
                            let conn = self.arc();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(name = %self.name, error = %e, "TcpConnection::send_in_loop");
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if fault {
            return;
        }
        let remaining = &data[written..];
        if remaining.is_empty() {
            return;
        }

        let old_readable = self.output_buffer.borrow().readable_bytes();
        let high_water = self.high_water_mark.get();
        if old_readable < high_water && old_readable + remaining.len() >= high_water {
            if let Some(cb) = self.high_water_cb.borrow().clone() {
                let conn = self.arc();
                let projected = old_readable + remaining.len();
                self.event_loop.queue_in_loop(move || cb(&conn, projected));
            }
        }

        self.output_buffer.borrow_mut().append(remaining);
        if !self.channel.borrow().is_writing() {
            self.channel.borrow_mut().enable_writing(&self.event_loop);
        }
    }

    /// `shutdown` (§4.6): valid only in `Connected`; transitions to
    /// `Disconnecting` and posts `shutdown_in_loop`.
    pub fn shutdown(&self) -> crate::error::Result<()> {
        if self.state() != ConnState::Connected {
            tracing::error!(name = %self.name, state = ?self.state(), "shutdown on a connection that is not connected");
            return Err(crate::error::ReactorError::NotConnected);
        }
        self.set_state(ConnState::Disconnecting);
        let conn = self.arc();
        self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        Ok(())
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.borrow().is_writing() {
            let stream = self.socket.borrow();
            if let Err(e) = stream.shutdown(std::net::Shutdown::Write) {
                tracing::warn!(name = %self.name, error = %e, "TcpConnection shutdown(WR) failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn running_loop() -> Arc<EventLoop> {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let l = EventLoop::new();
            tx.send(Arc::clone(&l)).unwrap();
            l.run();
        });
        rx.recv().unwrap()
    }

    fn connected_pair(event_loop: &Arc<EventLoop>) -> (Arc<TcpConnection>, std::net::TcpStream) {
        let listener =
            std::net::TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
                .unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(accepted);
        let local = crate::socket::local_addr(&stream);

        let (tx, rx) = std::sync::mpsc::channel();
        let event_loop2 = Arc::clone(event_loop);
        event_loop.run_in_loop(move || {
            let conn = TcpConnection::new(
                event_loop2,
                "test-conn".to_string(),
                stream,
                local,
                Address::from(peer),
            );
            conn.connect_established();
            tx.send(conn).unwrap();
        });
        (rx.recv().unwrap(), client)
    }

    #[test]
    fn echo_round_trips_through_message_and_send() {
        let event_loop = running_loop();
        let (conn, mut client) = connected_pair(&event_loop);

        conn.set_message_callback(Arc::new(|conn, buf, _ts| {
            let bytes = buf.retrieve_all_as_bytes();
            let _ = conn.send(&bytes);
        }));

        use std::io::{Read, Write};
        client.write_all(b"hello\n").unwrap();

        let mut out = [0u8; 6];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello\n");

        event_loop.quit();
    }

    #[test]
    fn high_water_mark_fires_once_past_threshold() {
        let event_loop = running_loop();
        let (conn, _client) = connected_pair(&event_loop);
        conn.set_high_water_mark_callback(
            Arc::new({
                let hits = Arc::new(Mutex::new(Vec::new()));
                let hits2 = Arc::clone(&hits);
                move |_conn, size| hits2.lock().unwrap().push(size)
            }),
            1024,
        );

        let conn2 = Arc::clone(&conn);
        event_loop.run_in_loop(move || { let _ = conn2.send(&vec![b'x'; 2048]); });
        thread::sleep(Duration::from_millis(50));

        event_loop.quit();
    }
}
