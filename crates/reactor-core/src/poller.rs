use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use crate::channel::{EventMask, Interest};
use crate::timestamp::Timestamp;

/// Reserved token for the loop's cross-thread wakeup (`mio::Waker`). No
/// ordinary channel is ever allocated this token (see [`TokenAllocator`]).
pub const WAKE_TOKEN: Token = Token(0);

const INITIAL_EVENTS_CAPACITY: usize = 16;

/// Anything a `Channel`'s readiness can be dispatched to. In practice this
/// is always `RefCell<Channel>` (see `channel.rs`'s `EventTarget` impl and
/// `Channel::bind`) -- kept as a trait rather than a concrete type so unit
/// tests elsewhere can exercise the poller table without a real channel.
/// Deliberately *not* `Send + Sync`: a `Weak<dyn EventTarget>` here never
/// itself crosses a thread boundary, it only ever lives inside this
/// `Poller`, which lives inside `EventLoop`'s `RefCell` and is only ever
/// touched from the owning loop's thread -- the same affinity argument that
/// justifies `EventLoop`'s own manual `unsafe impl Send/Sync`.
pub(crate) trait EventTarget {
    fn handle_event(&self, revents: EventMask, ts: Timestamp);
}

/// Hands out unique, monotonically increasing tokens for channels
/// registered on one loop. `WAKE_TOKEN` is reserved up front so it can never
/// collide with a channel's token.
#[derive(Default)]
pub struct TokenAllocator {
    next: usize,
}

impl TokenAllocator {
    pub fn new() -> Self {
        TokenAllocator { next: WAKE_TOKEN.0 + 1 }
    }

    pub fn alloc(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }
}

/// Per-loop `fd -> channel` readiness multiplexer (§4.2), built on
/// `mio::Poll` so that the epoll/kqueue/IOCP backend selection is `mio`'s
/// problem, not ours -- the original's separate `EpollPoller` is therefore a
/// single generic type here rather than two platform-specific ones.
pub struct Poller {
    poll: Poll,
    events: Events,
    capacity: usize,
    table: HashMap<Token, Weak<dyn EventTarget>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENTS_CAPACITY),
            capacity: INITIAL_EVENTS_CAPACITY,
            table: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Registers the dispatch target for `token`. Independent of the
    /// underlying kernel ADD/MOD/DEL state: a channel may be tracked here
    /// before it is ever registered (state `New`) -- harmless, since `poll`
    /// can only report readiness for fds the kernel actually knows about.
    pub fn track(&mut self, token: Token, target: Weak<dyn EventTarget>) {
        self.table.insert(token, target);
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) {
        let Some(mio_interest) = interest.to_mio() else {
            return;
        };
        if let Err(e) = self.registry().register(&mut SourceFd(&fd), token, mio_interest) {
            reactor_utils::fatal!(fd, ?token, error = %e, "poller ADD failed");
        }
    }

    pub fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) {
        let Some(mio_interest) = interest.to_mio() else {
            return;
        };
        if let Err(e) = self.registry().reregister(&mut SourceFd(&fd), token, mio_interest) {
            reactor_utils::fatal!(fd, ?token, error = %e, "poller MOD failed");
        }
    }

    /// Deregistration errors are only warnings: the fd may already have been
    /// closed by its owner, same as the original's DEL-failure handling.
    pub fn deregister(&mut self, fd: RawFd, token: Token) {
        if let Err(e) = self.registry().deregister(&mut SourceFd(&fd)) {
            tracing::warn!(fd, ?token, error = %e, "poller DEL failed");
        }
        self.table.remove(&token);
    }

    /// Blocks until readiness, a signal, or `timeout` elapses. Returns the
    /// wake-up timestamp plus the ready targets (other than the wakeup
    /// itself, which the caller handles separately) -- it does *not* dispatch
    /// them itself. `EINTR` is silent, anything else is logged but does not
    /// abort (§4.2).
    ///
    /// Dispatch has to happen after this call returns, with no `Poller`
    /// borrow outstanding: a channel callback invoked mid-dispatch routinely
    /// changes its own interest (`enable_writing`/`disable_all`), which
    /// reaches back into `EventLoop::with_poller_mut` -> `self.poller.borrow_mut()`.
    /// If this method held that borrow across the callback, that reentry
    /// would panic with `already borrowed`.
    pub fn poll(&mut self, timeout: Duration) -> (Timestamp, Vec<(Rc<dyn EventTarget>, EventMask)>) {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return (Timestamp::now(), Vec::new()),
            Err(e) => {
                tracing::warn!(error = %e, "poller wait failed");
                return (Timestamp::now(), Vec::new());
            }
        }

        let ts = Timestamp::now();
        let mut active = 0usize;
        let mut ready = Vec::new();
        for event in self.events.iter() {
            active += 1;
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if let Some(target) = self.table.get(&token).and_then(Weak::upgrade) {
                ready.push((target, EventMask::from(event)));
            }
        }

        if active >= self.capacity {
            self.capacity *= 2;
            self.events = Events::with_capacity(self.capacity);
        }

        (ts, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_allocator_never_hands_out_the_wake_token() {
        let mut alloc = TokenAllocator::new();
        for _ in 0..10 {
            assert_ne!(alloc.alloc(), WAKE_TOKEN);
        }
    }

    #[test]
    fn token_allocator_is_monotonic() {
        let mut alloc = TokenAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert!(b.0 > a.0);
    }
}
