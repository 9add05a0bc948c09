use std::io;

use thiserror::Error;

/// Errors a caller can meaningfully react to. Fatal initialization failures
/// (`socket`/`bind`/`listen`/poller setup, double event-loop per thread) are
/// deliberately *not* representable here -- they go through
/// [`reactor_utils::fatal`] and abort the process, matching the original's
/// `LOG_FATAL` + `exit(-1)` pairing.
#[derive(Error, Debug)]
pub enum ReactorError {
    /// The calling thread is not the loop's owning thread and the operation
    /// requires it (only `quit`, `run_in_loop`, and `queue_in_loop` are
    /// exempt from this check).
    #[error("operation requires the loop's own thread")]
    WrongThread,
    /// `TcpServer::start` was asked for a thread count after it was already
    /// started once.
    #[error("server already started")]
    AlreadyStarted,
    /// An operation was attempted on a connection that is not `Connected`.
    #[error("connection is not in the connected state")]
    NotConnected,
    /// Wraps a syscall failure that the caller should be able to inspect.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
