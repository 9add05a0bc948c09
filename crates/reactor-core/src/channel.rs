use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::{Arc, Weak};

use mio::Token;

use crate::event_loop::EventLoop;
use crate::poller::EventTarget;
use crate::timestamp::Timestamp;

/// Bitset of {READABLE, WRITABLE} interest / readiness. Unlike `mio::Interest`
/// this can represent "no interest", which the channel state machine (§4.2)
/// needs in order to tell ADD/MOD/DEL apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        match (self.contains(Interest::READABLE), self.contains(Interest::WRITABLE)) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// The readiness mask reported for one dispatch, translated out of
/// `mio::event::Event` at the point the multiplexer wakes up.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventMask {
    pub readable: bool,
    pub writable: bool,
    /// Peer half-closed / hung up with no more data coming.
    pub closed: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for EventMask {
    fn from(ev: &mio::event::Event) -> Self {
        EventMask {
            readable: ev.is_readable() || ev.is_priority(),
            writable: ev.is_writable(),
            closed: ev.is_read_closed() && !ev.is_readable(),
            error: ev.is_error(),
        }
    }
}

/// A channel's place in its multiplexer's `fd -> channel` table (§3):
/// `NEW`/`DELETED` channels are absent from the table, `ADDED` ones are
/// present. The invariant `fd ∈ table ⇔ state == Added` is maintained
/// entirely by [`Channel::update`] and [`Channel::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Added,
    Deleted,
}

/// Binds a file descriptor to an event loop's multiplexer (§3/§4.3). The
/// channel does not own the fd -- it only remembers its numeric value for
/// (re)registration; the owning object (`TcpConnection`'s socket,
/// `Acceptor`'s listener) is responsible for closing it.
pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: Interest,
    revents: EventMask,
    state: ChannelState,
    read_cb: Option<Box<dyn FnMut(Timestamp)>>,
    write_cb: Option<Box<dyn FnMut()>>,
    close_cb: Option<Box<dyn FnMut()>>,
    error_cb: Option<Box<dyn FnMut()>>,
    /// Weak keep-alive tie to the owning connection (§4.6's "Lifetime").
    /// Only used to extend the owner's lifetime for the duration of
    /// dispatch; the concrete type is erased since `Channel` itself has no
    /// reason to depend on `TcpConnection`.
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

impl Channel {
    pub fn new(fd: RawFd, token: Token) -> Self {
        Channel {
            fd,
            token,
            interest: Interest::NONE,
            revents: EventMask::default(),
            state: ChannelState::New,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
            tie: None,
        }
    }

    /// Allocates a token from `event_loop`, wraps a freshly constructed
    /// channel in `Rc<RefCell<_>>`, and tracks it in the loop's poller table
    /// (§3's dependency order: channel depends on the multiplexer's handle
    /// type). Must run on `event_loop`'s own thread -- a channel must not
    /// outlive its loop, and the converse (constructing one from off-thread)
    /// is never a legitimate use.
    pub fn bind(event_loop: &Arc<EventLoop>, fd: RawFd) -> Rc<RefCell<Channel>> {
        event_loop.assert_in_loop_thread();
        let token = event_loop.alloc_token();
        let channel = Rc::new(RefCell::new(Channel::new(fd, token)));
        let target = Rc::downgrade(&channel) as RcWeak<dyn EventTarget>;
        event_loop.register_target(token, target);
        channel
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_reading(&self) -> bool {
        self.interest.contains(Interest::READABLE)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.contains(Interest::WRITABLE)
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Timestamp) + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    pub fn set_tie(&mut self, tie: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(tie);
    }

    pub fn set_revents(&mut self, revents: EventMask) {
        self.revents = revents;
    }

    pub fn enable_reading(&mut self, event_loop: &Arc<EventLoop>) {
        self.interest.insert(Interest::READABLE);
        self.update(event_loop);
    }

    pub fn disable_reading(&mut self, event_loop: &Arc<EventLoop>) {
        self.interest.remove(Interest::READABLE);
        self.update(event_loop);
    }

    pub fn enable_writing(&mut self, event_loop: &Arc<EventLoop>) {
        self.interest.insert(Interest::WRITABLE);
        self.update(event_loop);
    }

    pub fn disable_writing(&mut self, event_loop: &Arc<EventLoop>) {
        self.interest.remove(Interest::WRITABLE);
        self.update(event_loop);
    }

    pub fn disable_all(&mut self, event_loop: &Arc<EventLoop>) {
        self.interest = Interest::NONE;
        self.update(event_loop);
    }

    /// Reconciles kernel registration with `self.interest` (§4.2's
    /// `Multiplexer::update`). ADD/MOD failures are fatal; this channel's fd
    /// came from a socket the OS just handed us, so a failure here means
    /// the poller itself is broken, not anything about the connection.
    fn update(&mut self, event_loop: &Arc<EventLoop>) {
        event_loop.with_poller_mut(|poller| match (self.state, self.interest.is_none()) {
            (ChannelState::New, false) | (ChannelState::Deleted, false) => {
                poller.register(self.fd, self.token, self.interest);
                self.state = ChannelState::Added;
            }
            (ChannelState::Added, true) => {
                poller.deregister(self.fd, self.token);
                self.state = ChannelState::Deleted;
            }
            (ChannelState::Added, false) => {
                poller.reregister(self.fd, self.token, self.interest);
            }
            _ => {}
        });
    }

    pub fn remove(&mut self, event_loop: &Arc<EventLoop>) {
        if self.state == ChannelState::Added {
            event_loop.with_poller_mut(|poller| poller.deregister(self.fd, self.token));
        }
        self.state = ChannelState::Deleted;
    }

    /// Takes the close callback out of `cell`, dropping the borrow before
    /// calling it, then puts it back. Every `invoke_*` helper below follows
    /// this same "take, release, call, restore" shape so that a callback
    /// which re-enters `cell` (e.g. `TcpConnection::send` touching its own
    /// channel's write interest from inside a read callback) never finds the
    /// `RefCell` already borrowed.
    fn invoke_close(cell: &RefCell<Channel>) {
        let cb = cell.borrow_mut().close_cb.take();
        if let Some(mut cb) = cb {
            cb();
            cell.borrow_mut().close_cb = Some(cb);
        }
    }

    fn invoke_error(cell: &RefCell<Channel>) {
        let cb = cell.borrow_mut().error_cb.take();
        if let Some(mut cb) = cb {
            cb();
            cell.borrow_mut().error_cb = Some(cb);
        }
    }

    fn invoke_read(cell: &RefCell<Channel>, ts: Timestamp) {
        let cb = cell.borrow_mut().read_cb.take();
        if let Some(mut cb) = cb {
            cb(ts);
            cell.borrow_mut().read_cb = Some(cb);
        }
    }

    fn invoke_write(cell: &RefCell<Channel>) {
        let cb = cell.borrow_mut().write_cb.take();
        if let Some(mut cb) = cb {
            cb();
            cell.borrow_mut().write_cb = Some(cb);
        }
    }
}

/// Every channel the poller dispatches to is reached through `Rc<RefCell<_>>`
/// (see [`Channel::bind`]) so this is the only `EventTarget` impl the crate
/// needs. Dispatch never holds `cell`'s borrow while a callback runs --
/// `send`/`shutdown`/interest changes made from inside a read or write
/// callback re-enter this same channel, and `RefCell` would otherwise panic
/// with `already borrowed` (§4.3's dispatch order is still close, error,
/// read, write; only the borrow discipline changes).
impl EventTarget for RefCell<Channel> {
    fn handle_event(&self, revents: EventMask, ts: Timestamp) {
        let tie = {
            let mut channel = self.borrow_mut();
            channel.set_revents(revents);
            channel.tie.clone()
        };

        // The upgraded strong reference is held for the whole dispatch,
        // matching §4.3's "upgraded first and held for the duration of
        // dispatch" -- but it must not borrow `self` while doing so.
        let _guard = match &tie {
            Some(tie) => match tie.upgrade() {
                Some(guard) => Some(guard),
                None => return,
            },
            None => None,
        };

        if revents.closed {
            Channel::invoke_close(self);
        }
        if revents.error {
            Channel::invoke_error(self);
        }
        if revents.readable {
            Channel::invoke_read(self, ts);
        }
        if revents.writable {
            Channel::invoke_write(self);
        }
    }
}
