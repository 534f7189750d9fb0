//! Composable cancellation tokens.
//!
//! A [`CancellationToken`] is a small state machine: *not cancelled* or
//! *cancelled(reason)*. The transition happens at most once, wakes every task
//! awaiting [`CancellationToken::cancelled`], and runs every registered
//! listener exactly once.
//!
//! [`CancellationToken::combine`] builds a token that fires when any parent
//! fires or when an optional deadline elapses. Combining is associative:
//! `combine([combine([a, b]), c])` fires under exactly the same conditions as
//! `combine([a, b, c])`, and carries the reason of whichever source fired first.
//!
//! ```rust
//! use quill::cancellation::{CancelReason, CancellationToken};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let caller = CancellationToken::new();
//! let combined = CancellationToken::combine(&[&caller], Some(Duration::from_secs(60)));
//!
//! caller.cancel();
//! assert_eq!(combined.reason(), Some(CancelReason::Caller));
//! # }
//! ```

use crate::error::QuillError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

/// Why a token was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for the abort
    Caller,
    /// A deadline elapsed before completion
    Deadline { timeout_ms: u64 },
}

impl CancelReason {
    /// Convert the reason into the error a cancelled operation reports
    pub fn into_error(self) -> QuillError {
        match self {
            CancelReason::Caller => QuillError::Cancelled,
            CancelReason::Deadline { timeout_ms } => QuillError::timeout(timeout_ms),
        }
    }
}

type Listener = Box<dyn FnOnce(CancelReason) + Send>;

struct Inner {
    reason: OnceLock<CancelReason>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    // Strong handles keep every ancestor alive as long as a descendant is.
    // Each entry also names the listener this token registered on that parent.
    parents: Mutex<Vec<(Arc<Inner>, u64)>>,
    wakeup: tokio_util::sync::CancellationToken,
}

impl Inner {
    fn new() -> Self {
        Self {
            reason: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            parents: Mutex::new(Vec::new()),
            wakeup: tokio_util::sync::CancellationToken::new(),
        }
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.wakeup.cancel();

        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for (_, listener) in listeners {
            listener(reason);
        }
        true
    }

    /// Store the listener, or run it at once if already cancelled.
    /// Returns the listener id when it was stored.
    fn register(&self, listener: Listener) -> Option<u64> {
        let mut guard = lock(&self.listeners);
        match self.reason.get() {
            Some(reason) => {
                let reason = *reason;
                drop(guard);
                listener(reason);
                None
            }
            None => {
                let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
                guard.push((id, listener));
                Some(id)
            }
        }
    }

    fn unregister(&self, id: u64) {
        // Dropped outside the lock, since a listener may own other tokens
        let removed = {
            let mut guard = lock(&self.listeners);
            let (removed, kept): (Vec<(u64, Listener)>, Vec<(u64, Listener)>) = std::mem::take(&mut *guard)
                .into_iter()
                .partition(|(listener_id, _)| *listener_id == id);
            *guard = kept;
            removed
        };
        drop(removed);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Stops a pending deadline timer once the last handle is gone
        self.wakeup.cancel();

        let parents = std::mem::take(&mut *lock(&self.parents));
        for (parent, id) in parents {
            parent.unregister(id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cancellation token with a reason and listener registration
///
/// Clones share state: cancelling any clone cancels all of them.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Caller-initiated cancel. Returns true if this call performed the transition.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Caller)
    }

    /// Cancel with an explicit reason. Returns true if this call performed the transition.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.inner.cancel(reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// The reason of the first cancellation, if any
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// Wait until the token is cancelled and return the reason
    pub async fn cancelled(&self) -> CancelReason {
        self.inner.wakeup.cancelled().await;
        // The reason is written before the wakeup fires.
        self.reason().unwrap_or(CancelReason::Caller)
    }

    /// Register a listener that runs exactly once when the token is cancelled.
    ///
    /// Runs immediately on the calling thread if the token is already cancelled.
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        self.inner.register(Box::new(listener));
    }

    /// Build a token that fires when any parent fires or the deadline elapses.
    ///
    /// The deadline timer runs on the tokio runtime and stops as soon as the
    /// combined token is cancelled by any source. The combined token keeps
    /// its parents alive, while parents only hold a weak reference back.
    /// Dropping the combined token removes its listeners from every parent.
    pub fn combine(parents: &[&CancellationToken], deadline: Option<Duration>) -> Self {
        let combined = Self::new();

        for parent in parents {
            let weak: Weak<Inner> = Arc::downgrade(&combined.inner);
            let registered = parent.inner.register(Box::new(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    inner.cancel(reason);
                }
            }));
            if let Some(id) = registered {
                lock(&combined.inner.parents).push((Arc::clone(&parent.inner), id));
            }
        }

        if let Some(timeout) = deadline {
            if !combined.is_cancelled() {
                let weak = Arc::downgrade(&combined.inner);
                let wakeup = combined.inner.wakeup.clone();
                let timeout_ms = timeout.as_millis() as u64;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(timeout) => {
                            if let Some(inner) = weak.upgrade() {
                                if inner.cancel(CancelReason::Deadline { timeout_ms }) {
                                    tracing::debug!(timeout_ms, "Deadline elapsed, cancelling request");
                                }
                            }
                        }
                        _ = wakeup.cancelled() => {}
                    }
                });
            }
        }

        combined
    }

    /// Shorthand for combining an optional caller token with a deadline
    pub fn with_deadline(caller: Option<&CancellationToken>, timeout: Duration) -> Self {
        match caller {
            Some(token) => Self::combine(&[token], Some(timeout)),
            None => Self::combine(&[], Some(timeout)),
        }
    }

    /// Run a future to completion unless the token fires first.
    ///
    /// The future is dropped on cancellation, which aborts any HTTP request it owns.
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Result<T, CancelReason>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            value = future => Ok(value),
        }
    }
}
