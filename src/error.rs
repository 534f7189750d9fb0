//! Error handling for the Quill orchestration layer
//!
//! Every failure that can reach a calling agent is a [`QuillError`]. The
//! variants follow how a failure should be treated, not where it came from:
//!
//! - **Timeout** - a deadline elapsed before the operation completed
//! - **Cancelled** - the caller aborted the request
//! - **TransportError** - non-2xx response or connection failure
//! - **MalformedResponse** - missing content or undecodable JSON
//! - **RetryExhausted** - the last retryable failure after every attempt was used
//! - **ModelLoadingError** - the server cannot load the requested model
//!
//! # Propagation
//!
//! ```rust
//! use quill::error::QuillError;
//!
//! # fn handle(error: QuillError) {
//! match error {
//!     _ if error.is_cancellation() => {
//!         // Never retried, never fallen back on
//!     }
//!     _ if error.is_retryable() => {
//!         // Transient: the retry engine tries again after a backoff delay
//!     }
//!     QuillError::ModelLoadingError { available_models, .. } => {
//!         println!("Pick one of: {}", available_models.join(", "));
//!     }
//!     other => eprintln!("Request failed: {}", other),
//! }
//! # }
//! ```
//!
//! Health probes never produce a `QuillError` for their callers; they degrade
//! the cached connection status instead.

use thiserror::Error;

/// Main error type for the Quill library
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuillError {
    /// Deadline elapsed before the operation completed
    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Caller-initiated abort
    #[error("Request cancelled by caller")]
    Cancelled,

    /// Non-2xx response or connection failure
    #[error("Transport error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    TransportError {
        status: Option<u16>,
        message: String,
    },

    /// Response arrived but could not be interpreted
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    /// Every attempt failed with a retryable error
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        last_error: Box<QuillError>,
        attempts: u32,
    },

    /// The server reported it cannot load the requested model
    #[error("Model '{model}' could not be loaded: {message}")]
    ModelLoadingError {
        model: String,
        message: String,
        available_models: Vec<String>,
    },

    /// A stream failed after text had already been delivered to the caller
    #[error("Stream interrupted after {delivered_chars} characters: {message}")]
    StreamInterrupted {
        delivered_chars: usize,
        message: String,
    },

    /// Configuration errors (invalid URLs, zero budgets, etc.)
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Internal library errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl QuillError {
    /// Create a Timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a TransportError without an HTTP status (connection failure)
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::TransportError {
            status: None,
            message: message.into(),
        }
    }

    /// Create a TransportError for a non-2xx HTTP status
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::TransportError {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a MalformedResponse error
    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Create a ConfigurationError
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Check if this error is transient and worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuillError::Timeout { .. }
                | QuillError::TransportError { .. }
                | QuillError::MalformedResponse { .. }
        )
    }

    /// Check if this error is a caller-initiated abort
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QuillError::Cancelled)
    }

    /// Check if an optimized-path failure should hand over to the direct path
    ///
    /// Anything except a caller abort or a model that cannot be loaded at all.
    pub fn should_fall_back(&self) -> bool {
        !matches!(
            self,
            QuillError::Cancelled | QuillError::ModelLoadingError { .. }
        )
    }

    /// The innermost error, looking through `RetryExhausted`
    pub fn root_cause(&self) -> &QuillError {
        match self {
            QuillError::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for QuillError {
    fn from(error: serde_json::Error) -> Self {
        QuillError::malformed_response(format!("JSON decode failed: {}", error))
    }
}

impl From<reqwest::Error> for QuillError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return QuillError::malformed_response(error.to_string());
        }
        QuillError::TransportError {
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

impl From<crate::config::ConfigError> for QuillError {
    fn from(error: crate::config::ConfigError) -> Self {
        QuillError::configuration_error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(QuillError::timeout(1000).is_retryable());
        assert!(QuillError::http_status(503, "busy").is_retryable());
        assert!(QuillError::malformed_response("no content").is_retryable());

        assert!(!QuillError::Cancelled.is_retryable());
        assert!(!QuillError::configuration_error("bad").is_retryable());
        assert!(!QuillError::ModelLoadingError {
            model: "m".into(),
            message: "no memory".into(),
            available_models: vec![],
        }
        .is_retryable());
    }

    #[test]
    fn test_fallback_classification() {
        assert!(QuillError::http_status(500, "boom").should_fall_back());
        assert!(QuillError::timeout(10).should_fall_back());
        assert!(!QuillError::Cancelled.should_fall_back());
    }

    #[test]
    fn test_display_includes_status() {
        let error = QuillError::http_status(502, "bad gateway");
        assert_eq!(error.to_string(), "Transport error (HTTP 502): bad gateway");

        let error = QuillError::transport_error("connection refused");
        assert_eq!(error.to_string(), "Transport error: connection refused");
    }

    #[test]
    fn test_root_cause_unwraps_retry_exhausted() {
        let error = QuillError::RetryExhausted {
            last_error: Box::new(QuillError::timeout(480_000)),
            attempts: 4,
        };
        assert_eq!(error.root_cause(), &QuillError::timeout(480_000));
        assert!(error.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_json_error_maps_to_malformed() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let error: QuillError = parse.unwrap_err().into();
        assert!(matches!(error, QuillError::MalformedResponse { .. }));
    }
}
