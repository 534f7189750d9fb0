//! Observability for the orchestration layer.
//!
//! All modules log through `tracing` with structured fields (`task`, `model`,
//! `attempt`, `latency_ms`); clinical text only ever appears as a length or a
//! short trace-level preview. This module installs the subscriber that turns
//! those events into console and rolling-file output.
//!
//! ```no_run
//! use quill::telemetry::{init_logging, LoggingConfig};
//!
//! # fn main() -> quill::Result<()> {
//! let _guard = init_logging(LoggingConfig::from_env())?;
//! tracing::info!(task = "tavi", "Ready");
//! # Ok(())
//! # }
//! ```

pub mod logging;

pub use logging::{init_logging, LoggingConfig, LoggingGuard};
