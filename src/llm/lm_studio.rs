//! LM Studio (OpenAI-compatible) chat backend.
//!
//! Sends `POST /v1/chat/completions` and reads either the single-shot JSON
//! body or the event stream. `GET /v1/models` is cached with the same
//! single-flight discipline as health probes and serves as remediation data
//! when the server cannot load a model.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use super::ChatBackend;
use crate::config::QuillConfig;
use crate::error::QuillError;
use crate::health::ProbeCache;
use crate::streaming::{self, EventStream};
use crate::types::{ChatResponse, RequestEnvelope};
use crate::utils::logging::truncate_string;
use crate::Result;

/// Server error text that means the model could not be loaded at all
static MODEL_LOADING_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)failed to load model|insufficient system resources|not enough memory|requires more memory|model loading was stopped",
    )
    .expect("model-loading pattern is a valid regex")
});

/// Whether server error text reports a model that cannot be loaded
pub fn is_model_loading_failure(message: &str) -> bool {
    MODEL_LOADING_FAILURE.is_match(message)
}

/// Client for a local LM Studio server
#[derive(Debug, Clone)]
pub struct LmStudioClient {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    models: ProbeCache<Vec<String>>,
}

impl LmStudioClient {
    /// Client with default timings for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(
            reqwest::Client::new(),
            base_url,
            Duration::from_secs(300),
            Duration::from_secs(2),
        )
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model_list_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            probe_timeout,
            models: ProbeCache::new(model_list_ttl),
        }
    }

    pub fn from_config(config: &QuillConfig, client: reqwest::Client) -> Self {
        Self::with_client(
            client,
            config.inference.base_url.clone(),
            config.inference.model_list_ttl,
            config.health.probe_timeout,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model list, from cache when fresh; stale data is served if a refresh fails
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let client = self.client.clone();
        let url = format!("{}/v1/models", self.base_url);
        let timeout = self.probe_timeout;
        self.models
            .get_or_stale(move || fetch_models(client, url, timeout))
            .await
    }

    /// Drop the cached model list so the next lookup refetches it
    pub fn invalidate_models(&self) {
        self.models.invalidate();
    }

    /// Send the request and return the accepted response, mapping failures
    async fn post_completion(&self, envelope: &RequestEnvelope) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = envelope.to_request_body();

        tracing::debug!(
            model = %envelope.model,
            stream = envelope.stream,
            messages = envelope.messages.len(),
            prompt_chars = envelope.messages.total_text_len(),
            max_tokens = envelope.max_output_tokens,
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "Chat completion request failed");
                QuillError::transport_error(format!("HTTP request failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = server_error_message(&error_text);

        if is_model_loading_failure(&message) {
            tracing::error!(model = %envelope.model, error = %message, "Server cannot load model");
            self.invalidate_models();
            let available_models = self.list_models().await.unwrap_or_default();
            return Err(QuillError::ModelLoadingError {
                model: envelope.model.clone(),
                message,
                available_models,
            });
        }

        match status.as_u16() {
            502 | 503 => tracing::warn!(status = status.as_u16(), error = %message, "Server unavailable, model may be loading"),
            _ => tracing::warn!(status = status.as_u16(), error = %message, "Chat completion rejected"),
        }
        Err(QuillError::http_status(status.as_u16(), message))
    }
}

#[async_trait]
impl ChatBackend for LmStudioClient {
    async fn complete(&self, envelope: &RequestEnvelope) -> Result<ChatResponse> {
        let start = std::time::Instant::now();
        let envelope = if envelope.stream {
            std::borrow::Cow::Owned(envelope.clone().streaming(false))
        } else {
            std::borrow::Cow::Borrowed(envelope)
        };

        let response = self.post_completion(&envelope).await?;
        let text = response.text().await.map_err(|e| {
            QuillError::transport_error(format!("Failed to read response text: {}", e))
        })?;
        tracing::trace!(body = %truncate_string(&text, 200), "Raw completion body");

        let json: serde_json::Value = serde_json::from_str(&text)?;
        let chat_response = streaming::parse_completion(&json)?;

        tracing::debug!(
            model = %envelope.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            content_chars = chat_response.content.chars().count(),
            finish_reason = ?chat_response.finish_reason,
            "Chat completion finished"
        );
        Ok(chat_response)
    }

    async fn stream(&self, envelope: &RequestEnvelope) -> Result<EventStream> {
        let envelope = if envelope.stream {
            std::borrow::Cow::Borrowed(envelope)
        } else {
            std::borrow::Cow::Owned(envelope.clone().streaming(true))
        };

        let response = self.post_completion(&envelope).await?;
        Ok(streaming::parse_event_stream(response.bytes_stream()))
    }

    async fn available_models(&self) -> Result<Vec<String>> {
        self.list_models().await
    }
}

async fn fetch_models(client: reqwest::Client, url: String, timeout: Duration) -> Result<Vec<String>> {
    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| QuillError::transport_error(format!("Model list request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(QuillError::http_status(
            status.as_u16(),
            "model list request rejected",
        ));
    }

    let body: serde_json::Value = response.json().await?;
    let models = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| QuillError::malformed_response("model list missing data array"))?
        .iter()
        .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
        .collect::<Vec<_>>();

    tracing::debug!(count = models.len(), "Fetched model list");
    Ok(models)
}

/// Best human-readable message from an error body
fn server_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let error = json.get("error");
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| error.and_then(|e| e.as_str()))
            .or_else(|| json.get("message").and_then(|m| m.as_str()));
        if let Some(message) = message {
            return message.to_string();
        }
    }
    truncate_string(body.trim(), 500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Messages};
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn envelope() -> RequestEnvelope {
        RequestEnvelope::new(
            "medgemma-27b-text-it-mlx",
            Messages::from(vec![Message::system("sys"), Message::user("dictation")]),
            0.3,
            8000,
        )
    }

    async fn mount_models(server: &MockServer, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "qwen/qwen3-4b-2507"}, {"id": "medgemma-4b-it"}]
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[test]
    fn test_model_loading_pattern_compiles() {
        let pattern = Lazy::force(&MODEL_LOADING_FAILURE);
        assert!(pattern.is_match("NOT ENOUGH MEMORY"));
    }

    #[test]
    fn test_model_loading_patterns() {
        assert!(is_model_loading_failure("Failed to load model 'medgemma-27b'"));
        assert!(is_model_loading_failure("Error: insufficient system resources"));
        assert!(is_model_loading_failure("The model requires more memory than available"));
        assert!(is_model_loading_failure("Model loading was stopped"));
        assert!(!is_model_loading_failure("context length exceeded"));
    }

    #[test]
    fn test_server_error_message_shapes() {
        assert_eq!(server_error_message(r#"{"error":{"message":"boom"}}"#), "boom");
        assert_eq!(server_error_message(r#"{"error":"bad model"}"#), "bad model");
        assert_eq!(server_error_message("  plain text  "), "plain text");
    }

    #[tokio::test]
    async fn test_complete_sends_envelope_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "medgemma-27b-text-it-mlx",
                "max_tokens": 8000,
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": " Report text \n"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 20, "completion_tokens": 2, "total_tokens": 22}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LmStudioClient::new(server.uri());
        let response = client.complete(&envelope()).await.unwrap();
        assert_eq!(response.content, "Report text");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_http_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .mount(&server)
            .await;

        let error = LmStudioClient::new(server.uri())
            .complete(&envelope())
            .await
            .unwrap_err();
        assert_eq!(error, QuillError::http_status(503, "Service Unavailable"));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_model_loading_error_carries_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "Failed to load model \"medgemma-27b-text-it-mlx\". Error: insufficient system resources"
            })))
            .mount(&server)
            .await;
        mount_models(&server, 1).await;

        let error = LmStudioClient::new(server.uri())
            .complete(&envelope())
            .await
            .unwrap_err();

        match &error {
            QuillError::ModelLoadingError {
                model,
                available_models,
                ..
            } => {
                assert_eq!(model, "medgemma-27b-text-it-mlx");
                assert_eq!(available_models, &vec!["qwen/qwen3-4b-2507", "medgemma-4b-it"]);
            }
            other => panic!("expected ModelLoadingError, got {:?}", other),
        }
        assert!(!error.is_retryable());
        assert!(!error.should_fall_back());
    }

    #[tokio::test]
    async fn test_model_list_is_cached() {
        let server = MockServer::start().await;
        mount_models(&server, 1).await;

        let client = LmStudioClient::new(server.uri());
        let (a, b) = tokio::join!(client.list_models(), client.list_models());
        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
        assert_eq!(client.available_models().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_parses_events() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = LmStudioClient::new(server.uri());
        let events: Vec<_> = client.stream(&envelope()).await.unwrap().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last(),
            Some(Ok(streaming::StreamEvent::Done { text, .. })) if text == "Hello"
        ));
    }
}
