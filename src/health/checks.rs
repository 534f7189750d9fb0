//! Subsystem probes
//!
//! One probe per local server: the inference server (`GET /v1/models`), the
//! transcription server and the optimization service (`GET /v1/health`). A
//! probe never fails; every problem is folded into the returned
//! [`SubsystemStatus`] with `running = false` or `ready = false` and an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Point-in-time status of one subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    /// The server answered the probe
    pub running: bool,
    /// The server reported it can take work (e.g. its model is loaded)
    pub ready: bool,
    pub port: Option<u16>,
    pub last_checked: Option<chrono::DateTime<chrono::Utc>>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl SubsystemStatus {
    /// Status for a probe that could not reach the server
    pub fn unreachable(port: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            running: false,
            ready: false,
            port,
            last_checked: Some(chrono::Utc::now()),
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Trait for subsystem probes
#[async_trait]
pub trait SubsystemProbe: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Probe the subsystem; must not fail
    async fn probe(&self) -> SubsystemStatus;
}

/// Port of a base URL, falling back to the scheme default
pub fn port_of(base_url: &str) -> Option<u16> {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.port_or_known_default())
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// GET a JSON document with a hard timeout
async fn fetch_json(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<(serde_json::Value, u64), String> {
    let start = Instant::now();
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| format!("no response within {}ms", timeout.as_millis()))?
        .map_err(|e| format!("connection failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ));
    }

    let remaining = timeout.saturating_sub(start.elapsed());
    let body = tokio::time::timeout(remaining, response.json::<serde_json::Value>())
        .await
        .map_err(|_| format!("no response within {}ms", timeout.as_millis()))?
        .map_err(|e| format!("invalid health payload: {}", e))?;

    Ok((body, start.elapsed().as_millis() as u64))
}

/// Probe of the inference server through its model list
pub struct InferenceProbe {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl InferenceProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SubsystemProbe for InferenceProbe {
    fn name(&self) -> &str {
        "inference"
    }

    async fn probe(&self) -> SubsystemStatus {
        let port = port_of(&self.base_url);
        match fetch_json(&self.client, &endpoint(&self.base_url, "/v1/models"), self.timeout).await {
            Ok((body, latency_ms)) => {
                let models = body
                    .get("data")
                    .and_then(|d| d.as_array())
                    .map(|d| d.len())
                    .unwrap_or(0);
                SubsystemStatus {
                    running: true,
                    ready: models > 0,
                    port,
                    last_checked: Some(chrono::Utc::now()),
                    latency_ms: Some(latency_ms),
                    error: (models == 0).then(|| "no models available".to_string()),
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "Inference server probe failed");
                SubsystemStatus::unreachable(port, error)
            }
        }
    }
}

/// Probe of the transcription server
pub struct TranscriptionProbe {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl TranscriptionProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SubsystemProbe for TranscriptionProbe {
    fn name(&self) -> &str {
        "transcription"
    }

    async fn probe(&self) -> SubsystemStatus {
        let port = port_of(&self.base_url);
        match fetch_json(&self.client, &endpoint(&self.base_url, "/v1/health"), self.timeout).await {
            Ok((body, latency_ms)) => {
                let status = body.get("status").and_then(|s| s.as_str()).unwrap_or("");
                let healthy = matches!(status, "ok" | "healthy");
                let model_loaded = body
                    .get("model_status")
                    .and_then(|s| s.as_str())
                    .map(|s| s == "loaded")
                    .unwrap_or(true);

                let error = if !healthy {
                    Some(format!("server reported status '{}'", status))
                } else if !model_loaded {
                    Some("transcription model not loaded".to_string())
                } else {
                    None
                };

                SubsystemStatus {
                    running: true,
                    ready: healthy && model_loaded,
                    port,
                    last_checked: Some(chrono::Utc::now()),
                    latency_ms: Some(latency_ms),
                    error,
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "Transcription server probe failed");
                SubsystemStatus::unreachable(port, error)
            }
        }
    }
}

/// Probe of the optimization service
pub struct OptimizationProbe {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OptimizationProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SubsystemProbe for OptimizationProbe {
    fn name(&self) -> &str {
        "optimization"
    }

    async fn probe(&self) -> SubsystemStatus {
        let configured_port = port_of(&self.base_url);
        match fetch_json(&self.client, &endpoint(&self.base_url, "/v1/health"), self.timeout).await {
            Ok((body, latency_ms)) => {
                let healthy = body.get("status").and_then(|s| s.as_str()) == Some("healthy");
                // dspy.ready, when present, is authoritative
                let ready = body
                    .get("dspy")
                    .and_then(|d| d.get("ready"))
                    .and_then(|r| r.as_bool())
                    .unwrap_or(healthy);
                let port = body
                    .get("server")
                    .and_then(|s| s.get("port"))
                    .and_then(|p| p.as_u64())
                    .and_then(|p| u16::try_from(p).ok())
                    .or(configured_port);

                SubsystemStatus {
                    running: true,
                    ready,
                    port,
                    last_checked: Some(chrono::Utc::now()),
                    latency_ms: Some(latency_ms),
                    error: (!ready).then(|| "optimization service not ready".to_string()),
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "Optimization service probe failed");
                SubsystemStatus::unreachable(configured_port, error)
            }
        }
    }
}
