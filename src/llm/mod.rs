//! Direct inference against a local OpenAI-compatible server.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator → SafetyGuard → retry::execute → ChatBackend (LmStudioClient)
//!                                   ↓                 ↓
//!                          per-attempt deadline   POST /v1/chat/completions
//! ```
//!
//! # Key Types
//!
//! - [`ChatBackend`] - seam for the inference server, substituted in tests
//! - [`LmStudioClient`] - reqwest implementation with a cached model list
//! - [`SafetyGuard`] - request rewrite for latency-sensitive model families
//! - [`retry::RetryPolicy`] - attempt count and fixed backoff schedule

pub mod lm_studio;
pub mod retry;
pub mod safety;

pub use lm_studio::LmStudioClient;
pub use retry::{RetryEvent, RetryPolicy};
pub use safety::SafetyGuard;

use async_trait::async_trait;

use crate::streaming::EventStream;
use crate::types::{ChatResponse, RequestEnvelope};
use crate::Result;

/// Chat completion backend
///
/// Implementations own request formatting, transport and response parsing.
/// Dropping a returned future or stream must abort the underlying request.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Single-shot completion
    async fn complete(&self, envelope: &RequestEnvelope) -> Result<ChatResponse>;

    /// Streamed completion; the request has been accepted when this returns
    async fn stream(&self, envelope: &RequestEnvelope) -> Result<EventStream>;

    /// Model identifiers currently served, possibly from cache
    async fn available_models(&self) -> Result<Vec<String>>;
}
