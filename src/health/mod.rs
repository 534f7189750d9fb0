//! Connection and health monitoring
//!
//! [`ConnectionMonitor`] probes the inference server, the transcription server
//! and the optimization service, caches each result for a TTL, and publishes a
//! merged [`ConnectionStatus`] snapshot.
//!
//! - Inside the TTL, `check_connection` answers from cache with no network I/O.
//! - Concurrent callers share one in-flight probe per subsystem.
//! - Subsystems are probed independently; one failing never fails another.
//! - Probes never return errors; failures become `is_connected = false` or
//!   `running = false` with an error message.
//!
//! UI consumers can [`subscribe`](ConnectionMonitor::subscribe) to be pushed
//! every change instead of polling.

pub mod cache;
pub mod checks;

pub use cache::ProbeCache;
pub use checks::*;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::cancellation::CancellationToken;
use crate::config::QuillConfig;

/// Merged snapshot handed to callers; always a copy, never the live state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// The inference server answered its last probe or served the last call
    pub is_connected: bool,
    pub last_ping: Option<chrono::DateTime<chrono::Utc>>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub inference: SubsystemStatus,
    pub transcription: SubsystemStatus,
    pub optimization: SubsystemStatus,
}

impl ConnectionStatus {
    fn merge(
        inference: SubsystemStatus,
        transcription: SubsystemStatus,
        optimization: SubsystemStatus,
    ) -> Self {
        Self {
            is_connected: inference.running,
            last_ping: inference.last_checked,
            latency_ms: inference.latency_ms,
            error: inference.error.clone(),
            inference,
            transcription,
            optimization,
        }
    }
}

/// Cached, de-duplicated health monitor for the local servers
pub struct ConnectionMonitor {
    inference: Arc<dyn SubsystemProbe>,
    transcription: Arc<dyn SubsystemProbe>,
    optimization: Arc<dyn SubsystemProbe>,
    inference_cache: ProbeCache<SubsystemStatus>,
    transcription_cache: ProbeCache<SubsystemStatus>,
    optimization_cache: ProbeCache<SubsystemStatus>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("ttl", &self.inference_cache.ttl())
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

impl ConnectionMonitor {
    /// Create a monitor over explicit probes, caching each result for `ttl`
    pub fn new(
        inference: Arc<dyn SubsystemProbe>,
        transcription: Arc<dyn SubsystemProbe>,
        optimization: Arc<dyn SubsystemProbe>,
        ttl: Duration,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            inference,
            transcription,
            optimization,
            inference_cache: ProbeCache::new(ttl),
            transcription_cache: ProbeCache::new(ttl),
            optimization_cache: ProbeCache::new(ttl),
            status_tx,
        }
    }

    /// Create a monitor with HTTP probes for the configured servers
    pub fn from_config(config: &QuillConfig, client: reqwest::Client) -> Self {
        let timeout = config.health.probe_timeout;
        Self::new(
            Arc::new(InferenceProbe::new(
                client.clone(),
                config.inference.base_url.clone(),
                timeout,
            )),
            Arc::new(TranscriptionProbe::new(
                client.clone(),
                config.transcription.base_url.clone(),
                timeout,
            )),
            Arc::new(OptimizationProbe::new(
                client,
                config.optimization.base_url.clone(),
                timeout,
            )),
            config.health.connection_ttl,
        )
    }

    /// Cached status; probes only the subsystems whose entry has expired
    pub async fn check_connection(&self) -> ConnectionStatus {
        let (inference, transcription, optimization) = tokio::join!(
            cached_probe(&self.inference_cache, &self.inference, false),
            cached_probe(&self.transcription_cache, &self.transcription, false),
            cached_probe(&self.optimization_cache, &self.optimization, false),
        );
        self.publish(ConnectionStatus::merge(inference, transcription, optimization))
    }

    /// Re-probe every subsystem, ignoring the cache
    pub async fn refresh(&self) -> ConnectionStatus {
        let (inference, transcription, optimization) = tokio::join!(
            cached_probe(&self.inference_cache, &self.inference, true),
            cached_probe(&self.transcription_cache, &self.transcription, true),
            cached_probe(&self.optimization_cache, &self.optimization, true),
        );
        self.publish(ConnectionStatus::merge(inference, transcription, optimization))
    }

    /// Cached optimization-service status, probing only that subsystem if stale
    pub async fn optimization_status(&self) -> SubsystemStatus {
        let status = cached_probe(&self.optimization_cache, &self.optimization, false).await;
        self.status_tx.send_if_modified(|current| {
            if current.optimization != status {
                current.optimization = status.clone();
                true
            } else {
                false
            }
        });
        status
    }

    /// Latest snapshot, with no network activity
    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Snapshots as a stream, starting with the current one
    pub fn status_stream(&self) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.subscribe())
    }

    /// Record a successful direct inference call as proof of connectivity
    pub fn record_inference_success(&self, latency: Duration) {
        let status = SubsystemStatus {
            running: true,
            ready: true,
            port: self.inference_cache.stale().and_then(|s| s.port),
            last_checked: Some(chrono::Utc::now()),
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        };
        self.inference_cache.store(status.clone());
        self.status_tx.send_modify(|current| {
            current.is_connected = true;
            current.last_ping = status.last_checked;
            current.latency_ms = status.latency_ms;
            current.error = None;
            current.inference = status;
        });
    }

    /// Refresh on a fixed interval until the token is cancelled
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Periodic connection monitoring stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let status = monitor.refresh().await;
                        tracing::trace!(connected = status.is_connected, "Periodic connection check");
                    }
                }
            }
        })
    }

    fn publish(&self, status: ConnectionStatus) -> ConnectionStatus {
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status.clone();
                true
            } else {
                false
            }
        });
        status
    }
}

async fn cached_probe(
    cache: &ProbeCache<SubsystemStatus>,
    probe: &Arc<dyn SubsystemProbe>,
    force: bool,
) -> SubsystemStatus {
    let probe = Arc::clone(probe);
    let name = probe.name().to_string();
    let run = move || async move {
        let status = probe.probe().await;
        tracing::debug!(
            subsystem = probe.name(),
            running = status.running,
            ready = status.ready,
            "Subsystem probed"
        );
        Ok(status)
    };

    let result = if force {
        cache.refresh(run).await
    } else {
        cache.get_or_probe(run).await
    };

    // Probes are infallible; only a panicked probe task lands here
    result.unwrap_or_else(|error| {
        tracing::warn!(subsystem = %name, error = %error, "Subsystem probe task failed");
        SubsystemStatus::unreachable(None, error.to_string())
    })
}
