//! Cooperative cancellation primitive shared by a run's workers.
//!
//! A `StopSignal` can be cloned and handed to every task of a run; raising
//! it on any clone wakes all waiters. In-flight operations are expected to
//! finish; the signal only prevents new work from being dispatched.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so raising any clone notifies
/// all waiters.
#[derive(Debug, Default)]
pub struct StopSignal {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    stopping: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Create a new, unraised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    ///
    /// After this call, `raised()` returns `true` and all pending `wait()`
    /// futures complete.
    pub fn raise(&self) {
        self.internal.stopping.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signalled.
    pub fn raised(&self) -> bool {
        self.internal.stopping.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signalled.
    ///
    /// Returns immediately if already raised.
    pub async fn wait(&self) {
        // Register interest before the re-check so a concurrent raise()
        // between the check and the await cannot be missed.
        loop {
            let notified = self.internal.notify.notified();
            if self.raised() {
                return;
            }
            notified.await;
        }
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if the
    /// signal is raised first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

impl Clone for StopSignal {
    fn clone(&self) -> Self {
        Self {
            internal: Arc::clone(&self.internal),
        }
    }
}
