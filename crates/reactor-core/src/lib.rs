//! A multi-reactor, one-loop-per-thread TCP server framework: a pair of
//! callbacks ("new connection", "bytes arrived") is all application code
//! writes, while this crate handles event demultiplexing, accept dispatch,
//! buffered non-blocking I/O, cross-thread task hand-off, and graceful
//! shutdown.
//!
//! Dependency order (leaves first): [`address`]/[`timestamp`]/
//! [`current_thread`] -> [`buffer`] -> [`poller`] -> [`channel`] ->
//! [`event_loop`] -> [`acceptor`]/[`event_loop_thread_pool`]/
//! [`tcp_connection`] -> [`server`].

mod acceptor;
mod address;
mod buffer;
mod callbacks;
mod channel;
mod current_thread;
mod error;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod poller;
mod server;
mod socket;
mod tcp_connection;
mod timestamp;

pub use address::Address;
pub use buffer::Buffer;
pub use callbacks::{ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};
pub use error::{ReactorError, Result};
pub use event_loop::EventLoop;
pub use event_loop_thread::ThreadInitCallback;
pub use server::{ServerOption, TcpServer};
pub use tcp_connection::{ConnState, TcpConnection};
pub use timestamp::Timestamp;
