//! TTL cache with single-flight refresh.
//!
//! Holds at most one value and at most one in-flight probe. Callers inside the
//! TTL get the cached value with no I/O; callers that arrive while a probe is
//! running join it instead of starting another. The probe runs as its own
//! task, so a caller that gives up (or is cancelled) never strands the
//! in-flight slot: the task finishes, stores its result and clears the slot.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::QuillError;
use crate::Result;

type PendingProbe<T> = Shared<BoxFuture<'static, Result<T>>>;

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

struct CacheState<T> {
    entry: Option<CacheEntry<T>>,
    pending: Option<PendingProbe<T>>,
    generation: u64,
}

/// Single-value cache shared by concurrent readers
pub struct ProbeCache<T> {
    ttl: Duration,
    state: Arc<Mutex<CacheState<T>>>,
}

impl<T> Clone for ProbeCache<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ProbeCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeCache").field("ttl", &self.ttl).finish()
    }
}

impl<T> ProbeCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(CacheState {
                entry: None,
                pending: None,
                generation: 0,
            })),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        lock_state(&self.state)
    }

    /// Cached value if it is still inside the TTL
    pub fn fresh(&self) -> Option<T> {
        let state = self.lock();
        state
            .entry
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Cached value regardless of age
    pub fn stale(&self) -> Option<T> {
        self.lock().entry.as_ref().map(|entry| entry.value.clone())
    }

    /// Replace the cached value and restart its TTL
    pub fn store(&self, value: T) {
        let mut state = self.lock();
        state.entry = Some(CacheEntry {
            value,
            fetched_at: Instant::now(),
        });
    }

    /// Drop the cached value; an in-flight probe is left to finish
    pub fn invalidate(&self) {
        self.lock().entry = None;
    }

    /// Whether a probe is currently running
    pub fn is_probing(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Fresh cached value, or the result of a (possibly shared) probe
    pub async fn get_or_probe<F, Fut>(&self, probe: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            if let Some(entry) = &state.entry {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
            self.join_or_start(&mut state, probe)
        };
        pending.await
    }

    /// Probe even if the cached value is fresh, joining one already running
    pub async fn refresh<F, Fut>(&self, probe: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            self.join_or_start(&mut state, probe)
        };
        pending.await
    }

    /// Like [`get_or_probe`](Self::get_or_probe), but a failed probe falls back
    /// to the last cached value when there is one
    pub async fn get_or_stale<F, Fut>(&self, probe: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.get_or_probe(probe).await {
            Ok(value) => Ok(value),
            Err(error) => match self.stale() {
                Some(value) => {
                    tracing::debug!(error = %error, "Probe failed, serving stale cache entry");
                    Ok(value)
                }
                None => Err(error),
            },
        }
    }

    fn join_or_start<F, Fut>(&self, state: &mut CacheState<T>, probe: F) -> PendingProbe<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(pending) = &state.pending {
            return pending.clone();
        }

        state.generation += 1;
        let generation = state.generation;
        let shared_state = self.state.clone();
        let probe = probe();

        let task = tokio::spawn(async move {
            let result = probe.await;
            let mut state = lock_state(&shared_state);
            if let Ok(value) = &result {
                state.entry = Some(CacheEntry {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
            }
            if state.generation == generation {
                state.pending = None;
            }
            result
        });

        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(QuillError::internal_error(format!("probe task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        state.pending = Some(pending.clone());
        pending
    }
}

fn lock_state<T>(state: &Mutex<CacheState<T>>) -> MutexGuard<'_, CacheState<T>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_probe(
        calls: &Arc<AtomicU32>,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32>> {
        let calls = calls.clone();
        move || {
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(n)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_value_served_without_probe() {
        let cache = ProbeCache::new(Duration::from_secs(120));
        let calls = Arc::new(AtomicU32::new(0));

        assert_eq!(cache.get_or_probe(counting_probe(&calls, Duration::ZERO)).await, Ok(1));
        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(cache.get_or_probe(counting_probe(&calls, Duration::ZERO)).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_or_probe(counting_probe(&calls, Duration::ZERO)).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_probe() {
        let cache = ProbeCache::new(Duration::from_secs(120));
        let calls = Arc::new(AtomicU32::new(0));

        let results = futures::future::join_all(
            (0..25).map(|_| cache.get_or_probe(counting_probe(&calls, Duration::from_millis(300)))),
        )
        .await;

        assert!(results.iter().all(|r| r == &Ok(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_probing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_joins_in_flight_probe() {
        let cache = ProbeCache::new(Duration::from_secs(120));
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            cache.refresh(counting_probe(&calls, Duration::from_secs(1))),
            cache.refresh(counting_probe(&calls, Duration::from_secs(1))),
        );
        assert_eq!((a, b), (Ok(1), Ok(1)));

        assert_eq!(cache.refresh(counting_probe(&calls, Duration::ZERO)).await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_does_not_leak_slot() {
        let cache = ProbeCache::new(Duration::from_secs(120));
        let calls = Arc::new(AtomicU32::new(0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_probe(counting_probe(&calls, Duration::from_secs(1))),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!cache.is_probing());
        assert_eq!(cache.fresh(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_falls_back_to_stale() {
        let cache = ProbeCache::new(Duration::from_secs(300));

        let failing = || async { Err::<u32, _>(QuillError::transport_error("connection refused")) };
        assert!(cache.get_or_stale(failing).await.is_err());

        cache.store(7);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.fresh(), None);
        assert_eq!(cache.get_or_stale(failing).await, Ok(7));
        // Failures are not cached
        assert!(!cache.is_probing());
        assert_eq!(cache.stale(), Some(7));
    }
}
