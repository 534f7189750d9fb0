//! Logging setup for processes embedding Quill
//!
//! Installs a `tracing` subscriber with a stderr console layer and, when a log
//! directory is configured, a daily-rolling file layer (JSON by default).
//! Keep the returned [`LoggingGuard`] alive until shutdown so buffered file
//! output is flushed.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::error::QuillError;

const ENV_LOG_DIR: &str = "QUILL_LOG_DIR";
const ENV_LOG_LEVEL: &str = "QUILL_LOG_LEVEL";
const ENV_CONSOLE_LOG_LEVEL: &str = "QUILL_CONSOLE_LOG_LEVEL";
const ENV_JSON_LOGS: &str = "QUILL_JSON_LOGS";

/// File name prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "quill.log";

/// HTTP stack crates that are chatty at debug level
const NOISY_TARGETS: &str = "hyper=warn,h2=warn,reqwest=warn,tokio=warn";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Directory for rolling log files; no file output when unset
    pub log_dir: Option<PathBuf>,
    /// Filter for file output
    pub file_log_level: String,
    /// Filter for console output
    pub console_log_level: String,
    pub console_enabled: bool,
    /// Write file output as JSON lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_log_level: "info".to_string(),
            console_log_level: "warn".to_string(),
            console_enabled: true,
            json_format: true,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from `QUILL_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
            if !dir.trim().is_empty() {
                config.log_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            config.file_log_level = level;
        }
        if let Ok(level) = std::env::var(ENV_CONSOLE_LOG_LEVEL) {
            config.console_log_level = level;
        }
        if let Ok(json) = std::env::var(ENV_JSON_LOGS) {
            config.json_format = json.parse().unwrap_or(true);
        }

        config
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_console_level(mut self, level: impl Into<String>) -> Self {
        self.console_log_level = level.into();
        self
    }
}

/// Guard that must be kept alive for the duration of the application
/// to ensure proper log flushing
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard")
            .field("file", &self._file_guard.is_some())
            .finish()
    }
}

fn filter(level: &str, fallback: &str) -> EnvFilter {
    EnvFilter::try_new(format!("{},{}", level, NOISY_TARGETS))
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", fallback, NOISY_TARGETS)))
}

/// Initialize the global subscriber
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, QuillError> {
    let console_layer = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_filter(filter(&config.console_log_level, "warn"))
    });

    let mut file_guard = None;
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                QuillError::configuration_error(format!("Failed to create log directory: {}", e))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::new(
                    "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
                ))
                .with_file(true)
                .with_line_number(true)
                .with_target(true);
            let filter = filter(&config.file_log_level, "info");
            Some(if config.json_format {
                layer.json().with_current_span(true).with_filter(filter).boxed()
            } else {
                layer.with_filter(filter).boxed()
            })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| QuillError::configuration_error(format!("Logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = ?config.log_dir,
        json_format = config.json_format,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
