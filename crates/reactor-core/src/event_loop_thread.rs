use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event_loop::EventLoop;

pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns a worker thread that constructs and runs exactly one `EventLoop`
/// (§3/§4.7). `start()` blocks until the loop pointer has been published,
/// using the same mutex/condvar pair that `Drop` takes before reading it --
/// resolving the destructor race the original design notes flag in §9:
/// there is no window where the published loop handle is half-torn-down.
pub struct EventLoopThread {
    name: String,
    init_callback: Option<ThreadInitCallback>,
    published: Arc<(Mutex<Option<Arc<EventLoop>>>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init_callback: Option<ThreadInitCallback>) -> Self {
        EventLoopThread {
            name: name.into(),
            init_callback,
            published: Arc::new((Mutex::new(None), Condvar::new())),
            thread: None,
        }
    }

    /// Spawns the worker thread and blocks until it has constructed its
    /// loop and published the handle.
    pub fn start(&mut self) -> Arc<EventLoop> {
        let published = Arc::clone(&self.published);
        let name = self.name.clone();
        let init_callback = self.init_callback.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                reactor_utils::name_current_thread(&name);
                let event_loop = EventLoop::new();
                if let Some(cb) = init_callback {
                    cb(&event_loop);
                }

                {
                    let (lock, condvar) = &*published;
                    let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                    *guard = Some(Arc::clone(&event_loop));
                    condvar.notify_one();
                }

                event_loop.run();

                let (lock, condvar) = &*published;
                let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                *guard = None;
                condvar.notify_one();
            })
            .expect("failed to spawn event loop thread");

        self.thread = Some(handle);

        let (lock, condvar) = &*self.published;
        let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_none() {
            guard = condvar.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        Arc::clone(guard.as_ref().unwrap())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let loop_handle = {
            let (lock, _condvar) = &*self.published;
            lock.lock().unwrap_or_else(|e| e.into_inner()).clone()
        };
        if let Some(event_loop) = loop_handle {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_blocks_until_loop_is_published_and_running() {
        let mut thread = EventLoopThread::new("test-io", None);
        let event_loop = thread.start();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(event_loop.is_running());
    }

    #[test]
    fn init_callback_runs_before_the_loop_is_published() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let cb: ThreadInitCallback = Arc::new(move |_loop| {
            flag2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let mut thread = EventLoopThread::new("test-init", Some(cb));
        let _event_loop = thread.start();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
