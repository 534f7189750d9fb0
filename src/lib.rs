//! Local-inference orchestration for clinical documentation agents.
//!
//! Quill sits between the agents that turn dictation into medical documents
//! and the model servers running on the same machine. Agents hand it a task id
//! and a conversation; Quill picks the model, token budget and deadline for the
//! task, decides between the optimization service and direct inference, retries
//! transient failures, streams deltas back, and keeps a cached, de-duplicated
//! view of which local servers are up.
//!
//! # Quick Start
//!
//! ```no_run
//! use quill::config::QuillConfig;
//! use quill::orchestrator::{CallerContext, Orchestrator, TaskRequest};
//! use quill::types::Messages;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = QuillConfig::load(None)?;
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!
//!     let messages = Messages::from_prompt(
//!         "You write concise TAVI workup reports.",
//!         "Severe AS, mean gradient 48, AVA 0.7, annulus 24 mm...",
//!     );
//!     let context = CallerContext::new().on_token(|delta| print!("{}", delta));
//!     let outcome = orchestrator
//!         .process(TaskRequest::new("tavi", messages).streaming(true), &context)
//!         .await?;
//!
//!     println!("\nserved by {} in {:?}", outcome.served_by, outcome.duration);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture Overview
//!
//! - **[`orchestrator::Orchestrator`]** - routing, fallback and retry for one request
//! - **[`config`]** - task profile table and `QUILL_*` environment overrides
//! - **[`cancellation::CancellationToken`]** - caller aborts combined with deadlines
//! - **[`llm`]** - the inference backend, retry engine and model safety guard
//! - **[`streaming`]** - event-stream decoding into ordered delta events
//! - **[`health::ConnectionMonitor`]** - cached, single-flight probes of every server
//! - **[`optimization`]** and **[`transcription`]** - clients for the side services
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`], whose error is [`QuillError`].
//! `Cancelled` always means the caller asked for it; it is never retried and
//! never triggers a fallback. Health probes and transcription never return
//! errors: they degrade into a status object or a placeholder transcript.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod health;
pub mod llm;
pub mod optimization;
pub mod orchestrator;
pub mod streaming;
pub mod telemetry;
pub mod transcription;
pub mod types;
pub mod utils;

pub use cancellation::{CancelReason, CancellationToken};
pub use config::QuillConfig;
pub use error::QuillError;
pub use orchestrator::{CallerContext, Orchestrator, ProcessOutcome, ServedBy, TaskRequest};
pub use types::*;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, QuillError>;
