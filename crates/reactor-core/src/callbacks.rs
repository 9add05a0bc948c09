use std::sync::Arc;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// Fired when a connection becomes `Connected` or becomes `Disconnected`
/// (§6).
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired whenever bytes were just appended to the input buffer.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer drains to empty after having been
/// non-empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired when a `send` would cross the configured high-water-mark
/// threshold, with the projected post-send size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal only -- wired by `TcpServer::new_connection` to
/// `remove_connection`. Not part of the public callback surface (§6 lists
/// only the four above as user-settable).
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
