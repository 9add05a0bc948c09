//! Per-thread cached identity (design note in §9: "the only module-level
//! mutable state... initialized lazily on first access and never torn
//! down"). Every event-loop-owned object checks its creating thread against
//! this cache before allowing a mutating call through.

use std::thread::{self, ThreadId};

thread_local! {
    static CACHED_ID: ThreadId = thread::current().id();
}

/// The `ThreadId` of the calling OS thread, cached in a `thread_local` so
/// repeated affinity checks (one per loop-mutating call) don't re-query the
/// runtime.
pub fn id() -> ThreadId {
    CACHED_ID.with(|id| *id)
}

pub fn is_current(id: ThreadId) -> bool {
    self::id() == id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_id_matches_thread_current() {
        assert_eq!(id(), thread::current().id());
    }

    #[test]
    fn is_current_detects_foreign_thread() {
        let this_thread = id();
        let other = thread::spawn(current_thread_id_probe).join().unwrap();
        assert!(is_current(this_thread));
        assert!(!is_current(other));
    }

    fn current_thread_id_probe() -> ThreadId {
        id()
    }
}
