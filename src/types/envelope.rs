//! Request and response shapes for `POST /v1/chat/completions`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::messages::Messages;

/// Sampling and reasoning overrides applied by the safety guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyOverrides {
    /// Ask the chat template to skip extended reasoning
    pub disable_reasoning: bool,
    pub top_p: f32,
    pub top_k: u32,
}

/// One outgoing chat completion request.
///
/// Built fresh for every call and never edited after dispatch; the safety
/// guard produces a new envelope instead of mutating this one.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub model: String,
    pub messages: Messages,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub stream: bool,
    pub safety: Option<SafetyOverrides>,
}

impl RequestEnvelope {
    pub fn new(model: impl Into<String>, messages: Messages, temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature,
            max_output_tokens,
            stream: false,
            safety: None,
        }
    }

    /// Same envelope with the stream flag set
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn reasoning_disabled(&self) -> bool {
        self.safety.as_ref().map(|s| s.disable_reasoning).unwrap_or(false)
    }

    /// JSON request body in the OpenAI-compatible format
    pub fn to_request_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": self.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
            "stream": self.stream,
        });

        if self.stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(safety) = &self.safety {
            body["top_p"] = serde_json::json!(safety.top_p);
            body["top_k"] = serde_json::json!(safety.top_k);
            if safety.disable_reasoning {
                body["chat_template_kwargs"] = serde_json::json!({ "enable_thinking": false });
            }
        }

        body
    }
}

/// Token usage reported by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "prompt_tokens", default)]
    pub input_tokens: u32,
    #[serde(rename = "completion_tokens", default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// True when the server sent an all-zero placeholder record
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

/// Response from one completed chat call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response content, trimmed
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Provider-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_request_body_shape() {
        let envelope = RequestEnvelope::new(
            "medgemma-27b-text-it-mlx",
            Messages::from_prompt("sys", "dictation"),
            0.3,
            8000,
        );
        let body = envelope.to_request_body();

        assert_eq!(body["model"], "medgemma-27b-text-it-mlx");
        assert_eq!(body["max_tokens"], 8000);
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["role"], "user");
        assert!(body.get("top_p").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_safety_overrides_serialized() {
        let mut envelope = RequestEnvelope::new(
            "qwen/qwen3-4b-2507",
            Messages::from(vec![Message::user("hi")]),
            0.3,
            2000,
        )
        .streaming(true);
        envelope.safety = Some(SafetyOverrides {
            disable_reasoning: true,
            top_p: 0.8,
            top_k: 20,
        });

        let body = envelope.to_request_body();
        assert_eq!(body["stream"], true);
        assert_eq!(body["top_k"], 20);
        assert_eq!(body["chat_template_kwargs"]["enable_thinking"], false);
        assert!(envelope.reasoning_disabled());
    }

    #[test]
    fn test_usage_deserializes_openai_names() {
        let usage: Usage = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42
        }))
        .unwrap();
        assert_eq!(usage, Usage::new(12, 30));
        assert!(!usage.is_empty());
    }
}
