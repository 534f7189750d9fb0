//! Request orchestration for clinical agents.
//!
//! The [`Orchestrator`] is the one entry point an agent calls to get text out
//! of a model. For every request it:
//!
//! 1. resolves the task profile (model, token budget, timeout),
//! 2. routes to the optimization service when the task is enabled for it and
//!    the service is healthy, otherwise straight to direct inference,
//! 3. on an optimized-path failure falls back to direct inference once,
//! 4. on the direct path applies the safety guard, then runs the call under
//!    the retry engine with a fresh deadline per attempt.
//!
//! A caller abort is never retried and never fallen back on; it surfaces as
//! [`QuillError::Cancelled`]. Every successful result records which path
//! served it and, after a fallback, why the optimized path was abandoned.
//!
//! ```no_run
//! use quill::config::QuillConfig;
//! use quill::orchestrator::{CallerContext, Orchestrator, TaskRequest};
//! use quill::types::Messages;
//!
//! # async fn run() -> quill::Result<()> {
//! let orchestrator = Orchestrator::from_config(&QuillConfig::from_env()?)?;
//! let messages = Messages::from_prompt("Summarise investigations.", "Echo: LVEF 55%");
//! let outcome = orchestrator
//!     .process(TaskRequest::new("investigation-summary", messages), &CallerContext::new())
//!     .await?;
//! println!("{} (served by {})", outcome.content, outcome.served_by);
//! # Ok(())
//! # }
//! ```

pub mod context;

pub use context::{CallerContext, ProgressCallback, ProgressUpdate, TokenCallback};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cancellation::{CancelReason, CancellationToken};
use crate::config::profiles::{ResolvedProfile, TaskProfiles};
use crate::config::{OptimizationConfig, QuillConfig};
use crate::error::QuillError;
use crate::health::ConnectionMonitor;
use crate::llm::retry::{self, RetryEvent, SlowRequestCallback, SlowRequestGuard};
use crate::llm::{ChatBackend, LmStudioClient, RetryPolicy, SafetyGuard};
use crate::optimization::{OptimizationBackend, OptimizationClient, ProcessRequest};
use crate::streaming;
use crate::types::{ChatResponse, Messages, RequestEnvelope, Usage};
use crate::utils::logging::preview;
use crate::Result;

/// Which backend produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedBy {
    Optimized,
    Direct,
}

impl std::fmt::Display for ServedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServedBy::Optimized => write!(f, "optimized"),
            ServedBy::Direct => write!(f, "direct"),
        }
    }
}

/// A prompt to process for a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task: String,
    pub messages: Messages,
    /// Deliver deltas to the caller's token callback as they arrive
    pub stream: bool,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, messages: Messages) -> Self {
        Self {
            task: task.into(),
            messages,
            stream: false,
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Successful result with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Trimmed response text
    pub content: String,
    pub served_by: ServedBy,
    /// Optimized-path error that caused a fallback to the direct path
    pub fallback_reason: Option<String>,
    /// Model used on the direct path; the task id on the optimized path
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Direct-path attempts made (0 when the optimized path served it)
    pub attempts: u32,
    pub duration: Duration,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Routes, retries and falls back on behalf of calling agents
pub struct Orchestrator {
    inference: Arc<dyn ChatBackend>,
    optimization: Option<Arc<dyn OptimizationBackend>>,
    optimization_config: OptimizationConfig,
    monitor: Arc<ConnectionMonitor>,
    profiles: TaskProfiles,
    safety: SafetyGuard,
    retry: RetryPolicy,
    temperature: f32,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("optimization", &self.optimization.is_some())
            .field("optimization_config", &self.optimization_config)
            .field("profiles", &self.profiles.tasks())
            .field("safety", &self.safety)
            .field("retry", &self.retry)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Orchestrator {
    /// Direct-only orchestrator with built-in profiles and default policies
    pub fn new(inference: Arc<dyn ChatBackend>, monitor: Arc<ConnectionMonitor>) -> Self {
        Self {
            inference,
            optimization: None,
            optimization_config: OptimizationConfig::default(),
            monitor,
            profiles: TaskProfiles::builtin(),
            safety: SafetyGuard::default(),
            retry: RetryPolicy::default(),
            temperature: crate::config::InferenceConfig::default().temperature,
        }
    }

    /// Wire up HTTP backends and the connection monitor from config
    pub fn from_config(config: &QuillConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| QuillError::internal_error(format!("Failed to build HTTP client: {}", e)))?;

        let monitor = Arc::new(ConnectionMonitor::from_config(config, client.clone()));
        let inference = Arc::new(LmStudioClient::from_config(config, client.clone()));
        let optimization = Arc::new(OptimizationClient::from_config(config, client));

        Ok(Self::new(inference, monitor)
            .with_profiles(config.task_profiles()?)
            .with_safety(SafetyGuard::from_config(&config.safety))
            .with_retry(RetryPolicy::from(&config.retry))
            .with_temperature(config.inference.temperature)
            .with_optimization(optimization, config.optimization.clone()))
    }

    pub fn with_optimization(
        mut self,
        backend: Arc<dyn OptimizationBackend>,
        config: OptimizationConfig,
    ) -> Self {
        self.optimization = Some(backend);
        self.optimization_config = config;
        self
    }

    pub fn with_profiles(mut self, profiles: TaskProfiles) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_safety(mut self, safety: SafetyGuard) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn profiles(&self) -> &TaskProfiles {
        &self.profiles
    }

    pub fn inference(&self) -> &Arc<dyn ChatBackend> {
        &self.inference
    }

    /// Process a prompt for a task
    pub async fn process(&self, request: TaskRequest, context: &CallerContext) -> Result<ProcessOutcome> {
        let start = Instant::now();
        if context.is_cancelled() {
            return Err(QuillError::Cancelled);
        }

        let profile = self.profiles.resolve(&request.task);
        let route = self.route(&request.task).await;
        let path = if route.is_some() {
            ServedBy::Optimized
        } else {
            ServedBy::Direct
        };
        tracing::info!(
            task = %request.task,
            path = %path,
            model = %profile.model,
            timeout_ms = profile.timeout_ms(),
            max_tokens = profile.max_tokens,
            stream = request.stream,
            "Processing request"
        );
        context.progress(ProgressUpdate::Routing {
            task: request.task.clone(),
            path,
            model: profile.model.clone(),
        });

        let mut fallback_reason = None;
        if let Some(backend) = route {
            match self.run_optimized(backend.as_ref(), &request, context).await {
                Ok(response) => {
                    return Ok(self.finish(
                        response,
                        ServedBy::Optimized,
                        None,
                        request.task.clone(),
                        0,
                        start,
                        context,
                    ))
                }
                Err(error) if !error.should_fall_back() => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        task = %request.task,
                        error = %error,
                        "Optimized path failed, falling back to direct inference"
                    );
                    context.progress(ProgressUpdate::Fallback {
                        reason: error.to_string(),
                    });
                    fallback_reason = Some(error.to_string());
                }
            }
        }

        let (response, attempts) = self.run_direct(&request, &profile, context).await?;
        self.monitor.record_inference_success(start.elapsed());
        Ok(self.finish(
            response,
            ServedBy::Direct,
            fallback_reason,
            profile.model,
            attempts,
            start,
            context,
        ))
    }

    /// Optimization backend to try first, if the task is enabled and the service is ready
    async fn route(&self, task: &str) -> Option<Arc<dyn OptimizationBackend>> {
        let backend = self.optimization.as_ref()?;
        if !self.optimization_config.is_enabled_for(task) {
            return None;
        }
        let status = self.monitor.optimization_status().await;
        if !status.ready {
            tracing::debug!(
                task,
                error = ?status.error,
                "Optimization service not ready, using direct inference"
            );
            return None;
        }
        Some(Arc::clone(backend))
    }

    /// Single attempt on the optimized path, bounded by the service timeout
    async fn run_optimized(
        &self,
        backend: &dyn OptimizationBackend,
        request: &TaskRequest,
        context: &CallerContext,
    ) -> Result<ChatResponse> {
        let transcript = request
            .messages
            .last_user_message()
            .map(|m| m.text())
            .unwrap_or_default();
        let process = ProcessRequest::new(
            request.task.clone(),
            transcript,
            self.optimization_config.timeout,
            self.optimization_config.fresh_run,
        );

        let parents: Vec<&CancellationToken> = context.cancel.iter().collect();
        let token = CancellationToken::combine(&parents, Some(self.optimization_config.timeout));
        token
            .run_until_cancelled(backend.process(&process))
            .await
            .map_err(CancelReason::into_error)?
    }

    /// Direct inference under the retry engine; returns the response and attempts used
    async fn run_direct(
        &self,
        request: &TaskRequest,
        profile: &ResolvedProfile,
        context: &CallerContext,
    ) -> Result<(ChatResponse, u32)> {
        let envelope = RequestEnvelope::new(
            profile.model.clone(),
            request.messages.clone(),
            self.temperature,
            profile.max_tokens,
        )
        .streaming(request.stream);
        let envelope = self.safety.apply(&envelope, &request.task);
        let envelope: &RequestEnvelope = &envelope;

        let caller = context.cancel.clone().unwrap_or_default();
        let slow_callback = context.on_progress.clone().map(|callback| {
            Arc::new(move |elapsed: Duration| callback(&ProgressUpdate::SlowRequest { elapsed }))
                as SlowRequestCallback
        });
        let _slow = SlowRequestGuard::start(
            self.retry.slow_request_threshold(profile.timeout),
            format!("{}:{}", request.task, profile.model),
            slow_callback,
        );

        let mut attempts = 0u32;
        let caller_ref = &caller;
        let timeout = profile.timeout;
        let response = retry::execute_observed(
            &self.retry,
            &caller,
            |event| match event {
                RetryEvent::Attempt { attempt, total } => {
                    attempts = attempt;
                    context.progress(ProgressUpdate::Attempt { attempt, total });
                }
                RetryEvent::Backoff {
                    next_attempt,
                    delay,
                    error,
                } => context.progress(ProgressUpdate::Backoff {
                    next_attempt,
                    delay,
                    error: error.to_string(),
                }),
            },
            |_attempt| {
                let token = CancellationToken::combine(&[caller_ref], Some(timeout));
                async move { self.attempt(envelope, &token, context).await }
            },
        )
        .await?;

        Ok((response, attempts))
    }

    /// One call to the inference backend under the attempt's deadline token
    async fn attempt(
        &self,
        envelope: &RequestEnvelope,
        token: &CancellationToken,
        context: &CallerContext,
    ) -> Result<ChatResponse> {
        if envelope.stream {
            let events = token
                .run_until_cancelled(self.inference.stream(envelope))
                .await
                .map_err(CancelReason::into_error)??;
            streaming::consume(events, token, |delta| context.token(delta)).await
        } else {
            token
                .run_until_cancelled(self.inference.complete(envelope))
                .await
                .map_err(CancelReason::into_error)?
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        response: ChatResponse,
        served_by: ServedBy,
        fallback_reason: Option<String>,
        model: String,
        attempts: u32,
        start: Instant,
        context: &CallerContext,
    ) -> ProcessOutcome {
        let duration = start.elapsed();
        tracing::info!(
            served_by = %served_by,
            model = %model,
            attempts,
            duration_ms = duration.as_millis() as u64,
            content_chars = response.content.chars().count(),
            fell_back = fallback_reason.is_some(),
            "Request completed"
        );
        tracing::trace!(content = %preview(&response.content, 80), "Response preview");
        context.progress(ProgressUpdate::Completed { served_by, duration });

        ProcessOutcome {
            content: response.content,
            served_by,
            fallback_reason,
            model,
            finish_reason: response.finish_reason,
            usage: response.usage,
            attempts,
            duration,
            metadata: response.metadata,
        }
    }
}
