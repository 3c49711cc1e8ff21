//! Drain tracking for the accept loop and connection tasks.
//!
//! Every task holds a [`DrainGuard`]; `transfer()` waits until all guards
//! are dropped before it serializes anything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts live tasks and wakes waiters when the last one exits.
#[derive(Debug, Clone, Default)]
pub(crate) struct DrainTracker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    active: AtomicUsize,
    notify: Notify,
}

/// Held by one tracked task. Decrements on drop.
#[derive(Debug)]
pub(crate) struct DrainGuard {
    shared: Arc<Shared>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let prev = self.shared.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.shared.notify.notify_waiters();
        }
    }
}

impl DrainTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track one more task.
    ///
    /// Take the guard before spawning so a concurrent `drained()` cannot miss
    /// the task.
    pub(crate) fn guard(&self) -> DrainGuard {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Wait until no tracked task is alive.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking, or a drop in between is missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
