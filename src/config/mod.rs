//! Configuration management
//!
//! Configuration for the orchestration layer: server endpoints, retry policy,
//! health-probe timing, the model safety guard and the task profile table.
//! Loaded from a file (TOML, YAML or JSON), from `QUILL_*` environment
//! variables, or both, with the environment taking precedence.
//!
//! Durations are written in milliseconds in config files.

pub mod profiles;

pub use profiles::{ProfileOverride, ResolvedProfile, TaskProfile, TaskProfiles};

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fs, path::Path, time::Duration};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main configuration structure for the Quill orchestration layer
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuillConfig {
    /// Local inference server
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Audio transcription server
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    /// Optional prompt-optimization service
    #[serde(default)]
    pub optimization: OptimizationConfig,
    /// Retry and backoff policy for direct inference
    #[serde(default)]
    pub retry: RetryConfig,
    /// Connection monitor timing
    #[serde(default)]
    pub health: HealthConfig,
    /// Model safety guard
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Per-task overrides layered over the built-in profile table
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverride>,
}

/// Local inference server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the OpenAI-compatible server
    #[serde(default = "default_inference_url")]
    pub base_url: String,
    /// Sampling temperature for every request
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// How long a fetched model list stays fresh
    #[serde(with = "duration_millis", default = "default_model_list_ttl")]
    pub model_list_ttl: Duration,
}

/// Transcription server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_url")]
    pub base_url: String,
    /// Model name sent with each transcription request
    #[serde(default = "default_transcription_model")]
    pub model: String,
    /// Upper bound on a single transcription request
    #[serde(with = "duration_millis", default = "default_transcription_timeout")]
    pub timeout: Duration,
}

/// Optimization service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Global switch; when false no task uses the optimized path
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_optimization_url")]
    pub base_url: String,
    /// Tasks routed to the optimized path when the service is healthy
    #[serde(default)]
    pub tasks: Vec<String>,
    /// Timeout forwarded to the service and applied to the call
    #[serde(with = "duration_millis", default = "default_optimization_timeout")]
    pub timeout: Duration,
    /// Ask the service to bypass its own result cache
    #[serde(default)]
    pub fresh_run: bool,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delays before each retry; the last value repeats
    #[serde(with = "duration_millis_vec", default = "default_backoff_schedule")]
    pub backoff_schedule: Vec<Duration>,
    /// Ceiling for the slow-request warning threshold
    #[serde(with = "duration_millis", default = "default_slow_request_cap")]
    pub slow_request_cap: Duration,
}

/// Connection monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How long a probe result stays fresh
    #[serde(with = "duration_millis", default = "default_connection_ttl")]
    pub connection_ttl: Duration,
    /// Timeout for each subsystem probe
    #[serde(with = "duration_millis", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    /// Interval for periodic status refresh
    #[serde(with = "duration_millis", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

/// Model safety guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Model-name fragments that identify latency-sensitive families
    #[serde(default = "default_model_families")]
    pub model_families: Vec<String>,
    /// Tasks that must not spend time on extended reasoning
    #[serde(default = "default_fast_tasks")]
    pub fast_tasks: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_url(),
            temperature: default_temperature(),
            model_list_ttl: default_model_list_ttl(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: default_transcription_url(),
            model: default_transcription_model(),
            timeout: default_transcription_timeout(),
        }
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_optimization_url(),
            tasks: Vec::new(),
            timeout: default_optimization_timeout(),
            fresh_run: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_schedule: default_backoff_schedule(),
            slow_request_cap: default_slow_request_cap(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            connection_ttl: default_connection_ttl(),
            probe_timeout: default_probe_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_families: default_model_families(),
            fast_tasks: default_fast_tasks(),
        }
    }
}

impl OptimizationConfig {
    /// Whether the optimized path is allowed for this task at all
    pub fn is_enabled_for(&self, task: &str) -> bool {
        self.enabled && self.tasks.iter().any(|t| t == task)
    }
}

const ENV_INFERENCE_URL: &str = "QUILL_INFERENCE_URL";
const ENV_TRANSCRIPTION_URL: &str = "QUILL_TRANSCRIPTION_URL";
const ENV_OPTIMIZATION_URL: &str = "QUILL_OPTIMIZATION_URL";
const ENV_OPTIMIZATION_ENABLED: &str = "QUILL_OPTIMIZATION_ENABLED";
const ENV_OPTIMIZED_TASKS: &str = "QUILL_OPTIMIZED_TASKS";
const ENV_TEMPERATURE: &str = "QUILL_TEMPERATURE";
const ENV_MAX_RETRIES: &str = "QUILL_MAX_RETRIES";
const ENV_HEALTH_TTL_SECS: &str = "QUILL_HEALTH_TTL_SECS";

impl QuillConfig {
    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            _ => Err(ConfigError::FileParse(
                "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_with_env()
    }

    /// Apply environment variable overrides (environment takes precedence)
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = env::var(ENV_INFERENCE_URL) {
            self.inference.base_url = url;
        }
        if let Ok(url) = env::var(ENV_TRANSCRIPTION_URL) {
            self.transcription.base_url = url;
        }
        if let Ok(url) = env::var(ENV_OPTIMIZATION_URL) {
            self.optimization.base_url = url;
        }
        if let Ok(enabled) = env::var(ENV_OPTIMIZATION_ENABLED) {
            self.optimization.enabled = parse_flag(&enabled);
        }
        if let Ok(tasks) = env::var(ENV_OPTIMIZED_TASKS) {
            self.optimization.tasks = tasks
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(temperature) = env::var(ENV_TEMPERATURE) {
            self.inference.temperature = temperature
                .parse()
                .map_err(|e| ConfigError::EnvVarParse(format!("{}: {}", ENV_TEMPERATURE, e)))?;
        }
        if let Ok(retries) = env::var(ENV_MAX_RETRIES) {
            self.retry.max_retries = retries
                .parse()
                .map_err(|e| ConfigError::EnvVarParse(format!("{}: {}", ENV_MAX_RETRIES, e)))?;
        }
        if let Ok(ttl) = env::var(ENV_HEALTH_TTL_SECS) {
            self.health.connection_ttl =
                Duration::from_secs(ttl.parse().map_err(|e| {
                    ConfigError::EnvVarParse(format!("{}: {}", ENV_HEALTH_TTL_SECS, e))
                })?);
        }

        Ok(self)
    }

    /// Load from an optional file, apply environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("inference.base_url", &self.inference.base_url)?;
        validate_url("transcription.base_url", &self.transcription.base_url)?;
        validate_url("optimization.base_url", &self.optimization.base_url)?;

        if !(0.0..=2.0).contains(&self.inference.temperature) {
            return Err(ConfigError::Validation(
                "Temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.inference.model_list_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "Model list TTL must be greater than 0".to_string(),
            ));
        }
        if self.transcription.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Transcription timeout must be greater than 0".to_string(),
            ));
        }
        if self.optimization.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Optimization timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_retries > 0 && self.retry.backoff_schedule.is_empty() {
            return Err(ConfigError::Validation(
                "Backoff schedule cannot be empty when retries are enabled".to_string(),
            ));
        }

        if self.health.connection_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "Connection TTL must be greater than 0".to_string(),
            ));
        }
        if self.health.probe_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Probe timeout must be greater than 0".to_string(),
            ));
        }
        if self.health.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        // Profile overrides are checked by building the table
        self.task_profiles()?;

        Ok(())
    }

    /// Built-in profile table with this config's overrides applied
    pub fn task_profiles(&self) -> Result<TaskProfiles, ConfigError> {
        TaskProfiles::with_overrides(&self.profiles)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{} cannot be empty", field)));
    }
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{} is not a valid URL: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Validation(format!(
            "{} must use http or https, got {}",
            field, other
        ))),
    }
}

/// Custom serialization for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_millis_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

// Default value functions for serde
fn default_inference_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_transcription_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_optimization_url() -> String {
    "http://localhost:8002".to_string()
}

fn default_transcription_model() -> String {
    "whisper-large-v3-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_model_list_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_transcription_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_optimization_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ]
}

fn default_slow_request_cap() -> Duration {
    Duration::from_secs(120)
}

fn default_connection_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_model_families() -> Vec<String> {
    vec!["qwen3".to_string()]
}

fn default_fast_tasks() -> Vec<String> {
    ["investigation-summary", "background", "medication", "quick-letter"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}
