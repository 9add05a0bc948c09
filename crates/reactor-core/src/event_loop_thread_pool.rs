use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

/// Fixed-size pool of I/O loops round-robined by the acceptor (§3/§4.7).
/// `set_thread_num` is only meaningful before `start`; `start` is itself
/// only ever called once by `TcpServer::start`'s idempotent guard.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    started: bool,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
    cursor: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: 0,
            started: false,
            threads: Vec::new(),
            loops: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Valid only before `start` (§4.7). Calling it after `start` is a
    /// post-condition violation (§7): logged, not fatal, and left a no-op
    /// rather than silently reinterpreted as "resize the running pool".
    pub fn set_thread_num(&mut self, n: usize) {
        if self.started {
            tracing::error!(name = %self.name, "set_thread_num after start has no effect");
            return;
        }
        self.num_threads = n;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// If `num_threads == 0`, `init_callback` runs synchronously against the
    /// base loop and `get_next_loop` always returns it -- the single-loop
    /// configuration muduo calls out explicitly in §4.7.
    pub fn start(&mut self, init_callback: Option<ThreadInitCallback>) {
        if self.started {
            return;
        }
        self.started = true;

        if self.num_threads == 0 {
            if let Some(cb) = init_callback {
                cb(&self.base_loop);
            }
            return;
        }

        for i in 0..self.num_threads {
            let thread_name = format!("{}-io-{}", self.name, i);
            let mut thread = EventLoopThread::new(thread_name, init_callback.clone());
            let event_loop = thread.start();
            self.threads.push(thread);
            self.loops.push(event_loop);
        }
    }

    /// Not thread-safe -- only the main loop's thread calls this (§4.7).
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[i])
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn base_loop() -> Arc<EventLoop> {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let l = EventLoop::new();
            tx.send(Arc::clone(&l)).unwrap();
            l.run();
        });
        rx.recv().unwrap()
    }

    #[test]
    fn zero_threads_always_returns_the_base_loop() {
        let base = base_loop();
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base), "pool");
        pool.start(None);
        for _ in 0..4 {
            assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
        }
        base.quit();
    }

    #[test]
    fn round_robins_across_n_threads() {
        let base = base_loop();
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base), "pool");
        pool.set_thread_num(4);
        pool.start(None);
        thread::sleep(Duration::from_millis(20));

        let picks: Vec<_> = (0..8).map(|_| pool.get_next_loop()).collect();
        for i in 0..4 {
            assert!(Arc::ptr_eq(&picks[i], &picks[i + 4]), "cursor should wrap every 4 picks");
        }
        base.quit();
    }
}
