//! The listening-socket half of the framework (§4.5). Bound to the main
//! loop only -- unlike [`crate::tcp_connection::TcpConnection`] an acceptor
//! is never shared across threads, so it is `Rc`-based rather than `Arc`-based,
//! grounded in `original_source/include/Acceptor.h`.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;

use crate::address::Address;
use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Installed by [`crate::server::TcpServer`]; invoked with the freshly
/// accepted stream and the peer's address (§4.5).
pub(crate) type NewConnectionCallback = Box<dyn FnMut(mio::net::TcpStream, Address)>;

struct AcceptorInner {
    listener: mio::net::TcpListener,
    new_connection_cb: Option<NewConnectionCallback>,
}

/// Owns a non-blocking, `SO_REUSEADDR` (optionally `SO_REUSEPORT`) listening
/// socket and the channel that watches it for readability. Lives for as
/// long as the `TcpServer` that owns it.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    channel: Rc<RefCell<Channel>>,
    inner: Rc<RefCell<AcceptorInner>>,
    listening: std::cell::Cell<bool>,
}

impl Acceptor {
    /// Builds the listener and its channel but does not yet register for
    /// readability -- that happens in [`Acceptor::listen`], matching the
    /// original's split between construction and `listen()`.
    pub fn new(event_loop: Arc<EventLoop>, addr: &Address, reuse_port: bool) -> Acceptor {
        event_loop.assert_in_loop_thread();
        let listener = crate::socket::create_listener(addr, reuse_port);
        let fd = listener.as_raw_fd();
        let channel = Channel::bind(&event_loop, fd);
        let inner = Rc::new(RefCell::new(AcceptorInner { listener, new_connection_cb: None }));

        {
            let inner2 = Rc::clone(&inner);
            channel.borrow_mut().set_read_callback(move |_ts| {
                Acceptor::handle_read(&inner2);
            });
        }

        Acceptor { event_loop, channel, inner, listening: std::cell::Cell::new(false) }
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(mio::net::TcpStream, Address) + 'static) {
        self.inner.borrow_mut().new_connection_cb = Some(Box::new(cb));
    }

    /// The address the listener actually bound to -- useful when `addr`
    /// was constructed with an ephemeral port (port `0`).
    pub fn local_addr(&self) -> Address {
        let listener = &self.inner.borrow().listener;
        match listener.local_addr() {
            Ok(std::net::SocketAddr::V4(v4)) => Address::new(*v4.ip(), v4.port()),
            Ok(std::net::SocketAddr::V6(_)) | Err(_) => Address::any(0),
        }
    }

    /// Registers the channel for readability (§4.5: "registered for reading
    /// when `listen()` is called").
    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.set(true);
        self.channel.borrow_mut().enable_reading(&self.event_loop);
    }

    /// One `accept` per readiness report, never a loop (§4.5). `EMFILE` is
    /// logged by name since it means the whole process is out of file
    /// descriptors, not just this accept; the listener stays armed either
    /// way.
    fn handle_read(inner: &Rc<RefCell<AcceptorInner>>) {
        let mut inner = inner.borrow_mut();
        match inner.listener.accept() {
            Ok((stream, peer)) => {
                let peer = Address::from(peer);
                if let Some(cb) = inner.new_connection_cb.as_mut() {
                    cb(stream, peer);
                } else {
                    tracing::debug!(%peer, "no new-connection callback installed, dropping accepted socket");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                tracing::error!("accept() failed: EMFILE, process is out of file descriptors");
            }
            Err(e) => {
                tracing::error!(error = %e, "accept() failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn running_loop() -> Arc<EventLoop> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let l = EventLoop::new();
            tx.send(Arc::clone(&l)).unwrap();
            l.run();
        });
        rx.recv().unwrap()
    }

    #[test]
    fn accepts_one_connection_per_readiness() {
        let event_loop = running_loop();

        let (tx, rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();
        let event_loop2 = Arc::clone(&event_loop);
        event_loop.run_in_loop(move || {
            let acceptor = Acceptor::new(event_loop2, &Address::loopback(0), false);
            acceptor.set_new_connection_callback(move |_stream, peer| {
                tx.send(peer).unwrap();
            });
            acceptor.listen();
            addr_tx.send(acceptor.local_addr()).unwrap();
            // The acceptor has to outlive the test, but nothing in this
            // crate owns it yet (that's `TcpServer`'s job) -- leak it for
            // the duration of this unit test rather than build a server.
            std::mem::forget(acceptor);
        });

        let bound = addr_rx.recv().unwrap();
        let _client = std::net::TcpStream::connect(bound.to_socket_addr()).unwrap();

        let peer = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peer.ip(), bound.ip());

        event_loop.quit();
    }
}
