//! What a calling agent hands the orchestrator alongside its request

use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;

use super::ServedBy;

/// Progress reported while a request is processed
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Backend chosen for the request
    Routing {
        task: String,
        path: ServedBy,
        model: String,
    },
    /// A direct-path attempt is starting
    Attempt { attempt: u32, total: u32 },
    /// The previous attempt failed; waiting before the next one
    Backoff {
        next_attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The request crossed its slow-request threshold
    SlowRequest { elapsed: Duration },
    /// The optimized path failed and the direct path takes over
    Fallback { reason: String },
    Completed {
        served_by: ServedBy,
        duration: Duration,
    },
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Caller-supplied cancellation and callbacks
///
/// ```rust
/// use quill::cancellation::CancellationToken;
/// use quill::orchestrator::CallerContext;
///
/// let stop = CancellationToken::new();
/// let context = CallerContext::new()
///     .with_cancel(stop.clone())
///     .on_token(|delta| print!("{}", delta));
/// assert!(context.cancel.is_some());
/// ```
#[derive(Clone, Default)]
pub struct CallerContext {
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
    /// Receives streamed deltas in arrival order
    pub on_token: Option<TokenCallback>,
}

impl std::fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerContext")
            .field("cancel", &self.cancel)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_token", &self.on_token.is_some())
            .finish()
    }
}

impl CallerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_token<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_token = Some(Arc::new(callback));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    pub(crate) fn progress(&self, update: ProgressUpdate) {
        if let Some(callback) = &self.on_progress {
            callback(&update);
        }
    }

    pub(crate) fn token(&self, delta: &str) {
        if let Some(callback) = &self.on_token {
            callback(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callbacks_are_optional() {
        let context = CallerContext::new();
        context.progress(ProgressUpdate::Fallback {
            reason: "down".to_string(),
        });
        context.token("ignored");
        assert!(!context.is_cancelled());
    }

    #[test]
    fn test_callbacks_receive_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tokens = seen.clone();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let progress = updates.clone();

        let context = CallerContext::new()
            .on_token(move |delta| tokens.lock().unwrap().push(delta.to_string()))
            .on_progress(move |update| progress.lock().unwrap().push(update.clone()));

        context.token("He");
        context.token("llo");
        context.progress(ProgressUpdate::Attempt { attempt: 1, total: 4 });

        assert_eq!(*seen.lock().unwrap(), vec!["He", "llo"]);
        assert_eq!(
            *updates.lock().unwrap(),
            vec![ProgressUpdate::Attempt { attempt: 1, total: 4 }]
        );
    }

    #[test]
    fn test_cancelled_state_follows_token() {
        let token = CancellationToken::new();
        let context = CallerContext::new().with_cancel(token.clone());
        assert!(!context.is_cancelled());
        token.cancel();
        assert!(context.is_cancelled());
    }
}
