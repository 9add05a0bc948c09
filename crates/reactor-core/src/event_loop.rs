use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::rc::Weak;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use mio::Token;

use crate::current_thread;
use crate::poller::{EventTarget, Poller, TokenAllocator};
use crate::timestamp::Timestamp;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default `multiplexer.poll` timeout (§4.2).
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    /// Enforces "exactly one event loop per OS thread" (§3). Set on
    /// construction, never cleared -- a loop is meant to own its thread for
    /// the thread's whole lifetime.
    static HAS_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// The reactor that owns a multiplexer, a wakeup mechanism, and a
/// pending-task queue (§3/§4.4). Every `EventLoop` is used behind an `Arc`
/// so the same loop handle can be posted into closures that run on other
/// threads -- but the loop's *contents* (the poller, its channel table) are
/// only ever touched from the one thread that called [`EventLoop::run`].
/// That affinity contract -- not the type system -- is what makes the
/// `Send`/`Sync` impls below sound; every mutating path re-checks
/// `assert_in_loop_thread` or goes through the `pending` mutex.
pub struct EventLoop {
    poller: RefCell<Poller>,
    tokens: RefCell<TokenAllocator>,
    waker: mio::Waker,
    pending: Mutex<VecDeque<Task>>,
    calling_pending: AtomicBool,
    thread_id: ThreadId,
    running: AtomicBool,
    quit: AtomicBool,
}

// SAFETY: every field access that isn't behind `pending`'s mutex or one of
// the lock-free atomics is preceded by an `assert_in_loop_thread` check (or
// only ever invoked from the owning thread by construction, e.g. `run`).
// This mirrors the original's raw `EventLoop*` passed freely between
// threads and guarded only by a runtime thread-id comparison (§4.4's
// contract), not by the C++ type system either.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Constructs a loop bound to the calling thread. Fatal if this thread
    /// already owns one, or if the poller/wakeup primitives can't be
    /// created (§7's "fatal initialization failures").
    pub fn new() -> Arc<EventLoop> {
        HAS_LOOP.with(|has| {
            if has.get() {
                reactor_utils::fatal!("attempted to construct a second EventLoop on one thread");
            }
            has.set(true);
        });

        let poller = match Poller::new() {
            Ok(p) => p,
            Err(e) => reactor_utils::fatal!(error = %e, "poller initialization failed"),
        };
        let waker = match mio::Waker::new(poller.registry(), crate::poller::WAKE_TOKEN) {
            Ok(w) => w,
            Err(e) => reactor_utils::fatal!(error = %e, "wakeup primitive initialization failed"),
        };

        Arc::new(EventLoop {
            poller: RefCell::new(poller),
            tokens: RefCell::new(TokenAllocator::new()),
            waker,
            pending: Mutex::new(VecDeque::new()),
            calling_pending: AtomicBool::new(false),
            thread_id: current_thread::id(),
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        })
    }

    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::is_current(self.thread_id)
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            reactor_utils::fatal!(
                owner = ?self.thread_id,
                caller = ?current_thread::id(),
                "operation performed off the owning event loop's thread"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs `task` inline if called from this loop's own thread, otherwise
    /// posts it (§4.4).
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue, then wakes the loop if the
    /// caller is on a different thread *or* the loop is presently draining
    /// its pending queue (§4.4's second clause -- without it, a task queued
    /// from inside a pending callback could sit unnoticed until some
    /// unrelated readiness event).
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        let should_wake = {
            let mut queue = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(Box::new(task) as Task);
            !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire)
        };
        if should_wake {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to signal event loop wakeup");
        }
    }

    /// The only cancellation primitive (§5). Does not drain outstanding
    /// work beyond the current iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn drain_pending(&self) {
        let tasks = {
            let mut queue = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *queue)
        };
        self.calling_pending.store(true, Ordering::Release);
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    /// `loop()` from §4.4: poll, dispatch ready channels, drain pending
    /// tasks, repeat until `quit()`. Must run on the constructing thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.running.store(true, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);

        while !self.quit.load(Ordering::SeqCst) {
            // `poll` only collects ready targets -- it must not hold the
            // poller's borrow while dispatching, since a channel callback
            // (e.g. enabling write interest from inside a read callback)
            // reaches back into `with_poller_mut` for the same `RefCell`.
            let (ts, ready) = self.poller.borrow_mut().poll(DEFAULT_POLL_TIMEOUT);
            for (target, revents) in ready {
                target.handle_event(revents, ts);
            }
            self.drain_pending();
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn alloc_token(&self) -> Token {
        self.tokens.borrow_mut().alloc()
    }

    pub(crate) fn register_target(&self, token: Token, target: Weak<dyn EventTarget>) {
        self.poller.borrow_mut().track(token, target);
    }

    pub(crate) fn with_poller_mut<R>(&self, f: impl FnOnce(&mut Poller) -> R) -> R {
        f(&mut self.poller.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        event_loop.run_in_loop(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_tasks_run_in_fifo_order_once_the_loop_runs() {
        let event_loop = new_running_loop();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            event_loop.queue_in_loop(move || seen.lock().unwrap().push(i));
        }

        thread::sleep(Duration::from_millis(30));
        event_loop.quit();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cross_thread_post_wakes_a_blocked_loop() {
        let event_loop = new_running_loop();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter2 = Arc::clone(&counter);
        event_loop.queue_in_loop(move || {
            counter2.store(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        event_loop.quit();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// `EventLoop::new()` must be called on the same thread that later calls
    /// `run()`, because of the one-loop-per-thread affinity check -- so this
    /// helper constructs *and* runs the loop on a dedicated background
    /// thread, handing the caller back an `Arc` it can post tasks to and
    /// `quit()` from any other thread.
    fn new_running_loop() -> Arc<EventLoop> {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let l = EventLoop::new();
            tx.send(Arc::clone(&l)).unwrap();
            l.run();
        });
        rx.recv().unwrap()
    }
}
