mod assert;
mod thread;

pub use thread::{ThreadPriority, name_current_thread, thread_boot};
