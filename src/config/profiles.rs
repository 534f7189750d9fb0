//! Task profile table.
//!
//! Maps a task identifier to the model, output-token budget and timeout used
//! for its requests. The table is built once at startup from the built-in
//! entries plus any config overrides, validated, and never changes afterwards.
//! Lookups never fail: unknown tasks resolve to the `default` entry.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::ConfigError;

/// Fast model for short, structured tasks
pub const QUICK_MODEL: &str = "qwen/qwen3-4b-2507";
/// Larger model for long procedural reports
pub const REASONING_MODEL: &str = "medgemma-27b-text-it-mlx";
/// Entry used for every task without its own profile
pub const DEFAULT_TASK: &str = "default";

/// Model, token budget and timeout for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProfile {
    pub model: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl TaskProfile {
    fn new(model: &str, max_tokens: u32, timeout_ms: u64) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            timeout_ms,
        }
    }
}

/// Partial profile from config; unset fields keep the built-in value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Result of a profile lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    /// The task that was asked for, even if it fell back to `default`
    pub task: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ResolvedProfile {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

static BUILTIN: Lazy<HashMap<String, TaskProfile>> = Lazy::new(|| {
    [
        (DEFAULT_TASK, TaskProfile::new(REASONING_MODEL, 4000, 300_000)),
        ("investigation-summary", TaskProfile::new(QUICK_MODEL, 2000, 60_000)),
        ("background", TaskProfile::new(QUICK_MODEL, 2000, 60_000)),
        ("medication", TaskProfile::new(QUICK_MODEL, 2000, 60_000)),
        ("quick-letter", TaskProfile::new(QUICK_MODEL, 5000, 120_000)),
        ("consultation", TaskProfile::new(REASONING_MODEL, 6000, 300_000)),
        ("angiogram-pci", TaskProfile::new(REASONING_MODEL, 8000, 480_000)),
        ("tavi", TaskProfile::new(REASONING_MODEL, 8000, 480_000)),
        ("mteer", TaskProfile::new(REASONING_MODEL, 8000, 480_000)),
    ]
    .into_iter()
    .map(|(task, profile)| (task.to_string(), profile))
    .collect()
});

/// Validated, immutable task profile table
#[derive(Debug, Clone)]
pub struct TaskProfiles {
    entries: HashMap<String, TaskProfile>,
    default: TaskProfile,
}

impl Default for TaskProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TaskProfiles {
    /// The table shipped with the crate
    pub fn builtin() -> Self {
        let entries = BUILTIN.clone();
        let default = entries[DEFAULT_TASK].clone();
        Self { entries, default }
    }

    /// Build a table from explicit entries; one of them must be `default`
    pub fn from_entries(entries: HashMap<String, TaskProfile>) -> Result<Self, ConfigError> {
        for (task, profile) in &entries {
            validate_entry(task, profile)?;
        }
        let default = entries.get(DEFAULT_TASK).cloned().ok_or_else(|| {
            ConfigError::Validation("Profile table must contain a 'default' entry".to_string())
        })?;
        Ok(Self { entries, default })
    }

    /// Built-in table with config overrides layered on top
    ///
    /// An override for an unknown task starts from the `default` entry.
    pub fn with_overrides(overrides: &HashMap<String, ProfileOverride>) -> Result<Self, ConfigError> {
        let mut entries = BUILTIN.clone();
        for (task, patch) in overrides {
            let base = entries
                .get(task)
                .or_else(|| entries.get(DEFAULT_TASK))
                .cloned()
                .ok_or_else(|| ConfigError::Validation("Missing default profile".to_string()))?;
            let merged = TaskProfile {
                model: patch.model.clone().unwrap_or(base.model),
                max_tokens: patch.max_tokens.unwrap_or(base.max_tokens),
                timeout_ms: patch.timeout_ms.unwrap_or(base.timeout_ms),
            };
            entries.insert(task.clone(), merged);
        }
        Self::from_entries(entries)
    }

    /// Resolve a task to its profile, falling back to `default`
    pub fn resolve(&self, task: &str) -> ResolvedProfile {
        let profile = self.entries.get(task).unwrap_or(&self.default);
        ResolvedProfile {
            task: task.to_string(),
            model: profile.model.clone(),
            max_tokens: profile.max_tokens,
            timeout: Duration::from_millis(profile.timeout_ms),
        }
    }

    /// Whether the task has its own entry
    pub fn contains(&self, task: &str) -> bool {
        self.entries.contains_key(task)
    }

    /// Task ids in the table, sorted
    pub fn tasks(&self) -> Vec<&str> {
        let mut tasks: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        tasks.sort_unstable();
        tasks
    }
}

fn validate_entry(task: &str, profile: &TaskProfile) -> Result<(), ConfigError> {
    if profile.model.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Profile '{}' has an empty model name",
            task
        )));
    }
    if profile.max_tokens == 0 {
        return Err(ConfigError::Validation(format!(
            "Profile '{}' must have a max_tokens greater than 0",
            task
        )));
    }
    if profile.timeout_ms == 0 {
        return Err(ConfigError::Validation(format!(
            "Profile '{}' must have a timeout greater than 0",
            task
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let profiles = TaskProfiles::builtin();

        let summary = profiles.resolve("investigation-summary");
        assert_eq!(summary.model, QUICK_MODEL);
        assert_eq!(summary.max_tokens, 2000);
        assert_eq!(summary.timeout, Duration::from_millis(60_000));

        let tavi = profiles.resolve("tavi");
        assert_eq!(tavi.model, REASONING_MODEL);
        assert_eq!(tavi.max_tokens, 8000);
        assert_eq!(tavi.timeout_ms(), 480_000);
    }

    #[test]
    fn test_unknown_tasks_resolve_to_default() {
        let profiles = TaskProfiles::builtin();
        let default = profiles.resolve(DEFAULT_TASK);

        for task in ["", "unknown", "TAVI", "pre-op-plan", "ai-medical-review"] {
            let resolved = profiles.resolve(task);
            assert_eq!(resolved.task, task);
            assert_eq!(resolved.model, default.model);
            assert_eq!(resolved.max_tokens, default.max_tokens);
            assert_eq!(resolved.timeout, default.timeout);
        }
        assert!(!profiles.contains("unknown"));
    }

    #[test]
    fn test_every_entry_is_non_zero() {
        let profiles = TaskProfiles::builtin();
        for task in profiles.tasks() {
            let resolved = profiles.resolve(task);
            assert!(resolved.max_tokens > 0, "{} has zero tokens", task);
            assert!(!resolved.timeout.is_zero(), "{} has zero timeout", task);
        }
    }

    #[test]
    fn test_overrides_patch_and_add() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "quick-letter".to_string(),
            ProfileOverride {
                timeout_ms: Some(90_000),
                ..Default::default()
            },
        );
        overrides.insert(
            "right-heart-cath".to_string(),
            ProfileOverride {
                max_tokens: Some(7000),
                ..Default::default()
            },
        );

        let profiles = TaskProfiles::with_overrides(&overrides).unwrap();
        let letter = profiles.resolve("quick-letter");
        assert_eq!(letter.model, QUICK_MODEL);
        assert_eq!(letter.max_tokens, 5000);
        assert_eq!(letter.timeout, Duration::from_secs(90));

        let rhc = profiles.resolve("right-heart-cath");
        assert_eq!(rhc.model, REASONING_MODEL);
        assert_eq!(rhc.max_tokens, 7000);
        assert_eq!(rhc.timeout_ms(), 300_000);
    }

    #[test]
    fn test_invalid_tables_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "tavi".to_string(),
            ProfileOverride {
                max_tokens: Some(0),
                ..Default::default()
            },
        );
        assert!(TaskProfiles::with_overrides(&overrides).is_err());

        let mut entries = HashMap::new();
        entries.insert("tavi".to_string(), TaskProfile::new(REASONING_MODEL, 10, 10));
        assert!(TaskProfiles::from_entries(entries).is_err());
    }
}
