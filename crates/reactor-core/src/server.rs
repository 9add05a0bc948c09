//! `TcpServer` (§4.8): wires the acceptor, the I/O loop pool, and the
//! `name -> connection` table together. Grounded in
//! `original_source/include/TcpServer.h` + `src/TcpServer.cc`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::address::Address;
use crate::callbacks::{ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::tcp_connection::TcpConnection;

/// Whether the listening socket sets `SO_REUSEPORT` (§6's external
/// interface surface).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

#[derive(Default)]
struct Callbacks {
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<HighWaterMarkCallback>,
    high_water_mark: usize,
}

/// State reachable from any thread that holds a connection's close
/// callback: the connection table and enough identity to build the next
/// connection's name (§3's `TcpServer` fields, minus the acceptor and loop
/// pool, which stay exclusively on the main loop's thread and are reached
/// through `Rc`, not through this `Arc`-shared struct). Every field here is
/// already `Send + Sync` on its own (`Mutex`, `AtomicUsize`, the manually
/// `Send + Sync` `Arc<EventLoop>`), so `Shared` needs no unsafe impls of its
/// own.
struct Shared {
    base_loop: Arc<EventLoop>,
    name: String,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

/// §4.8's `removeConnection`: always hops to the main loop first, regardless
/// of which thread called it, so the map mutation itself never races with
/// `new_connection`. A free function rather than a method because it needs
/// to move an owned `Arc<Shared>` into the posted task, and `&Arc<Self>` is
/// not a receiver type stable Rust accepts.
fn remove_connection(shared: &Arc<Shared>, conn: Arc<TcpConnection>) {
    let shared2 = Arc::clone(shared);
    shared.base_loop.queue_in_loop(move || remove_connection_in_loop(&shared2, conn));
}

fn remove_connection_in_loop(shared: &Arc<Shared>, conn: Arc<TcpConnection>) {
    shared.base_loop.assert_in_loop_thread();
    let removed = shared.connections.lock().unwrap_or_else(|e| e.into_inner()).remove(conn.name());
    reactor_utils::safe_assert!(removed.is_some(), "removed a connection not present in the table");
    let io_loop = conn.get_loop();
    io_loop.queue_in_loop(move || conn.connect_destroyed());
}

/// Owns the acceptor, the loop pool, and a [`Shared`] handle to the
/// connection table (§3). The acceptor and pool are deliberately *not*
/// part of `Shared`: both are `Rc`-based internally and therefore confined
/// to the thread that constructs and starts this server -- the
/// overwhelmingly common usage (construct, configure, `start()`, all from
/// one thread) needs nothing more, and the type system refuses to post
/// either cross-thread if that assumption is ever violated.
pub struct TcpServer {
    shared: Arc<Shared>,
    acceptor: Acceptor,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    thread_init_cb: Option<ThreadInitCallback>,
    started: AtomicBool,
}

impl TcpServer {
    pub fn new(base_loop: Arc<EventLoop>, listen_addr: Address, name: impl Into<String>, option: ServerOption) -> Self {
        base_loop.assert_in_loop_thread();
        let name = name.into();
        let acceptor = Acceptor::new(Arc::clone(&base_loop), &listen_addr, option == ServerOption::ReusePort);
        let pool = Rc::new(RefCell::new(EventLoopThreadPool::new(Arc::clone(&base_loop), name.clone())));

        let shared = Arc::new(Shared {
            base_loop,
            name,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            callbacks: Mutex::new(Callbacks::default()),
        });

        {
            let shared2 = Arc::clone(&shared);
            let pool2 = Rc::clone(&pool);
            acceptor.set_new_connection_callback(move |stream, peer| {
                let io_loop = pool2.borrow().get_next_loop();
                new_connection(&shared2, io_loop, stream, peer);
            });
        }

        TcpServer { shared, acceptor, pool, thread_init_cb: None, started: AtomicBool::new(false) }
    }

    pub fn set_thread_num(&mut self, n: usize) {
        self.pool.borrow_mut().set_thread_num(n);
    }

    pub fn set_thread_init_callback(&mut self, cb: ThreadInitCallback) {
        self.thread_init_cb = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner()).connection_cb = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner()).message_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner()).write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        let mut guard = self.shared.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        guard.high_water_cb = Some(cb);
        guard.high_water_mark = mark;
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> Address {
        self.acceptor.local_addr()
    }

    /// Idempotent (§4.8): the first call starts the loop pool, then arms
    /// the acceptor. `self.acceptor.listen()` stands in for the original's
    /// `mainLoop_->runInLoop(std::bind(&Acceptor::listen, get_pointer(acceptor_)))`
    /// -- `Acceptor` is `Rc`-based and non-`Send`, so it cannot be boxed
    /// into `run_in_loop`'s task type; since `start()` itself already
    /// asserts it is running on the main loop's thread, calling `listen()`
    /// directly is equivalent for every legitimate caller.
    pub fn start(&mut self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.base_loop.assert_in_loop_thread();
        self.pool.borrow_mut().start(self.thread_init_cb.clone());
        self.acceptor.listen();
    }
}

/// §4.8's `newConnection`: picks an I/O loop, builds a unique name, wraps
/// the accepted socket, registers the server's four callbacks plus the
/// close callback that routes back through `Shared::remove_connection`,
/// inserts into the table, then posts `connect_established` onto the
/// connection's own loop.
fn new_connection(shared: &Arc<Shared>, io_loop: Arc<EventLoop>, stream: mio::net::TcpStream, peer: Address) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let conn_name = format!("{}-{}#{}", shared.name, peer, conn_id);
    tracing::info!(name = %conn_name, %peer, "TcpServer: new connection");

    let local_addr = crate::socket::local_addr(&stream);
    crate::socket::set_nodelay(&stream, true);

    let shared2 = Arc::clone(shared);
    let io_loop2 = Arc::clone(&io_loop);
    io_loop.run_in_loop(move || {
        let conn = TcpConnection::new(io_loop2, conn_name.clone(), stream, local_addr, peer);

        {
            let guard = shared2.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = guard.connection_cb.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = guard.message_cb.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = guard.write_complete_cb.clone() {
                conn.set_write_complete_callback(cb);
            }
            if let Some(cb) = guard.high_water_cb.clone() {
                conn.set_high_water_mark_callback(cb, guard.high_water_mark);
            }
        }

        let shared3 = Arc::clone(&shared2);
        conn.set_close_callback(Arc::new(move |conn| {
            remove_connection(&shared3, Arc::clone(conn));
        }));

        shared2.connections.lock().unwrap_or_else(|e| e.into_inner()).insert(conn_name.clone(), Arc::clone(&conn));
        conn.connect_established();
    });
}
