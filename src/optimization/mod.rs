//! Optimization service client.
//!
//! The optimization service runs learned prompt programs for selected tasks.
//! It takes the raw transcript for a task and returns the finished text:
//!
//! ```text
//! POST /v1/dspy/process
//! {"agent_type": "angiogram-pci", "transcript": "...", "request_id": "<uuid>",
//!  "options": {"timeout": 300000, "fresh_run": false}}
//!
//! 200 {"success": true, "result": "...", "cached": false, "processing_time": 1234}
//! ```
//!
//! Its liveness is probed by the connection monitor, not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::QuillConfig;
use crate::error::QuillError;
use crate::types::ChatResponse;
use crate::utils::logging::truncate_string;
use crate::Result;

/// Options forwarded to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Milliseconds the service may spend on the request
    pub timeout: u64,
    /// Bypass the service's own result cache
    pub fresh_run: bool,
}

/// Body of `POST /v1/dspy/process`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub agent_type: String,
    pub transcript: String,
    pub request_id: Uuid,
    pub options: ProcessOptions,
}

impl ProcessRequest {
    /// New request with a fresh request id
    pub fn new(
        agent_type: impl Into<String>,
        transcript: impl Into<String>,
        timeout: Duration,
        fresh_run: bool,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            transcript: transcript.into(),
            request_id: Uuid::new_v4(),
            options: ProcessOptions {
                timeout: timeout.as_millis() as u64,
                fresh_run,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    cached: bool,
    #[serde(default)]
    processing_time: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Optimized-path backend
#[async_trait]
pub trait OptimizationBackend: Send + Sync {
    /// Run the task's optimized program over the transcript
    async fn process(&self, request: &ProcessRequest) -> Result<ChatResponse>;
}

/// HTTP client for the optimization service
#[derive(Debug, Clone)]
pub struct OptimizationClient {
    client: reqwest::Client,
    base_url: String,
}

impl OptimizationClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &QuillConfig, client: reqwest::Client) -> Self {
        Self::new(client, config.optimization.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl OptimizationBackend for OptimizationClient {
    async fn process(&self, request: &ProcessRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/dspy/process", self.base_url);
        tracing::debug!(
            task = %request.agent_type,
            request_id = %request.request_id,
            transcript_chars = request.transcript.chars().count(),
            fresh_run = request.options.fresh_run,
            "Sending optimization request"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| QuillError::transport_error(format!("Optimization request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            QuillError::transport_error(format!("Failed to read optimization response: {}", e))
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ProcessResponse>(&text)
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| truncate_string(&text, 200));
            return Err(QuillError::http_status(status.as_u16(), message));
        }

        let body: ProcessResponse = serde_json::from_str(&text)?;
        if body.success == Some(false) {
            return Err(QuillError::malformed_response(format!(
                "optimization service reported failure: {}",
                body.error.as_deref().unwrap_or("no error message")
            )));
        }

        let content = body.result.as_deref().map(str::trim).unwrap_or_default();
        if content.is_empty() {
            return Err(QuillError::malformed_response(
                "optimization service returned an empty result",
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("cached".to_string(), serde_json::Value::Bool(body.cached));
        metadata.insert(
            "request_id".to_string(),
            serde_json::Value::String(request.request_id.to_string()),
        );
        if let Some(processing_time) = body.processing_time {
            metadata.insert("processing_time_ms".to_string(), serde_json::json!(processing_time));
        }

        tracing::debug!(
            task = %request.agent_type,
            cached = body.cached,
            processing_time_ms = ?body.processing_time,
            content_chars = content.chars().count(),
            "Optimization request finished"
        );

        Ok(ChatResponse {
            content: content.to_string(),
            finish_reason: None,
            usage: None,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ProcessRequest {
        ProcessRequest::new("angiogram-pci", "LAD 70% stenosis", Duration::from_secs(300), false)
    }

    #[test]
    fn test_request_body_shape() {
        let request = ProcessRequest::new("tavi", "text", Duration::from_millis(1500), true);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["agent_type"], "tavi");
        assert_eq!(body["transcript"], "text");
        assert_eq!(body["options"], json!({"timeout": 1500, "fresh_run": true}));
        assert!(Uuid::parse_str(body["request_id"].as_str().unwrap()).is_ok());

        let other = ProcessRequest::new("tavi", "text", Duration::from_millis(1500), true);
        assert_ne!(request.request_id, other.request_id);
    }

    #[tokio::test]
    async fn test_process_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/dspy/process"))
            .and(body_partial_json(json!({
                "agent_type": "angiogram-pci",
                "transcript": "LAD 70% stenosis",
                "options": {"timeout": 300000, "fresh_run": false}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": "  Report body\n",
                "cached": true,
                "processing_time": 1234
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OptimizationClient::new(reqwest::Client::new(), format!("{}/", server.uri()));
        let response = client.process(&request()).await.unwrap();
        assert_eq!(response.content, "Report body");
        assert_eq!(response.metadata["cached"], json!(true));
        assert_eq!(response.metadata["processing_time_ms"], json!(1234.0));
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/dspy/process"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "success": false,
                "error": "DSPy not enabled for agent type: angiogram-pci"
            })))
            .mount(&server)
            .await;

        let client = OptimizationClient::new(reqwest::Client::new(), server.uri());
        let error = client.process(&request()).await.unwrap_err();
        match error {
            QuillError::TransportError { status, message } => {
                assert_eq!(status, Some(500));
                assert!(message.contains("DSPy not enabled"));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_bodies_are_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/dspy/process"))
            .and(body_partial_json(json!({"agent_type": "tavi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "predictor crashed"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/dspy/process"))
            .and(body_partial_json(json!({"agent_type": "mteer"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": "   "
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/dspy/process"))
            .and(body_partial_json(json!({"agent_type": "consultation"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = OptimizationClient::new(reqwest::Client::new(), server.uri());
        for task in ["tavi", "mteer", "consultation"] {
            let request = ProcessRequest::new(task, "text", Duration::from_secs(1), false);
            let error = client.process(&request).await.unwrap_err();
            assert!(
                matches!(error, QuillError::MalformedResponse { .. }),
                "{}: {:?}",
                task,
                error
            );
        }
    }
}
