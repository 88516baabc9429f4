//! Shared cancellation flags for groups of merges.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A counter-based blocker: while any lock is held (or `cancel_forever`
/// was called) every merge watching this blocker aborts at its next
/// checkpoint. Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct ActionBlocker {
    counter: Arc<AtomicUsize>,
}

impl ActionBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.counter.load(Ordering::Relaxed) > 0
    }

    /// Block until the returned guard is dropped.
    pub fn cancel(&self) -> ActionLock {
        self.counter.fetch_add(1, Ordering::Relaxed);
        ActionLock {
            counter: Some(self.counter.clone()),
        }
    }

    /// Block permanently.
    pub fn cancel_forever(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Guard returned by [`ActionBlocker::cancel`].
#[derive(Debug)]
pub struct ActionLock {
    counter: Option<Arc<AtomicUsize>>,
}

impl Drop for ActionLock {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
