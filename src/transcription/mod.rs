//! Audio transcription client.
//!
//! Posts recorded dictation to the local Whisper-compatible server
//! (`POST /v1/audio/transcriptions`, multipart `file` field). Transcription
//! never fails from the caller's point of view: when the server is down or
//! rejects the audio, the returned [`Transcript`] is a placeholder whose text
//! says what went wrong, so the UI still has something to show.

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::{QuillConfig, TranscriptionConfig};
use crate::error::QuillError;
use crate::Result;

/// Engine name for transcripts produced by the server
pub const HTTP_ENGINE: &str = "http";
/// Engine name for placeholder transcripts
pub const PLACEHOLDER_ENGINE: &str = "placeholder";

/// Result of transcribing one recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub engine: String,
    pub model: Option<String>,
    /// Seconds the server spent transcribing
    pub duration: Option<f64>,
    /// Why a placeholder was returned
    pub error: Option<String>,
}

impl Transcript {
    /// Placeholder describing a failed transcription
    pub fn placeholder(file_name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            text: format!("[Transcription unavailable for {}: {}]", file_name, reason),
            engine: PLACEHOLDER_ENGINE.to_string(),
            model: None,
            duration: None,
            error: Some(reason),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.engine == PLACEHOLDER_ENGINE
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    model: Option<String>,
}

/// Client for the transcription server
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl TranscriptionClient {
    pub fn new(client: reqwest::Client, config: &TranscriptionConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout,
        }
    }

    pub fn from_config(config: &QuillConfig, client: reqwest::Client) -> Self {
        Self::new(client, &config.transcription)
    }

    /// Transcribe audio bytes; failures come back as a placeholder transcript
    pub async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Transcript {
        let size = audio.len();
        match self.request(audio, file_name).await {
            Ok(transcript) => {
                tracing::info!(
                    file = file_name,
                    bytes = size,
                    chars = transcript.text.chars().count(),
                    duration_s = ?transcript.duration,
                    "Transcription completed"
                );
                transcript
            }
            Err(error) => {
                tracing::warn!(file = file_name, error = %error, "Transcription failed, returning placeholder");
                Transcript::placeholder(file_name, error.to_string())
            }
        }
    }

    /// Read a file and transcribe it
    pub async fn transcribe_file(&self, path: &Path) -> Transcript {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();
        match tokio::fs::read(path).await {
            Ok(audio) => self.transcribe(audio, &file_name).await,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "Could not read audio file");
                Transcript::placeholder(&file_name, format!("could not read audio file: {}", error))
            }
        }
    }

    async fn request(&self, audio: Vec<u8>, file_name: &str) -> Result<Transcript> {
        if audio.is_empty() {
            return Err(QuillError::configuration_error("audio is empty"));
        }

        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| QuillError::internal_error(format!("Invalid audio part: {}", e)))?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QuillError::timeout(self.timeout.as_millis() as u64)
                } else {
                    QuillError::transport_error(format!("Transcription request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error"))
                .to_string();
            return Err(QuillError::http_status(status.as_u16(), message));
        }

        let body: TranscriptionBody = response.json().await?;
        Ok(Transcript {
            text: body.text.trim().to_string(),
            engine: HTTP_ENGINE.to_string(),
            model: body.model.or_else(|| Some(self.model.clone())),
            duration: body.duration,
            error: None,
        })
    }
}
