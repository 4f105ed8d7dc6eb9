//! Engine configuration: defaults, TOML file, and persisted settings.
//!
//! Precedence from lowest to highest: built-in defaults, an optional TOML
//! file, then key/value settings in the store. The engine re-reads store
//! settings at the start of every cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Every setting the engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default target project when a start request names none.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    /// Command used to run the project's tests.
    #[serde(default)]
    pub test_command: Option<String>,
    /// Maximum cycles per session; 0 means unlimited.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Spend ceiling in USD; 0 means unlimited.
    #[serde(default = "default_budget_usd")]
    pub budget_usd: f64,
    /// Run discovery every N cycles; 0 disables.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u32,
    /// Run review every N cycles; 0 disables.
    #[serde(default = "default_review_interval")]
    pub review_interval: u32,
    /// Checkpoint before change cycles and roll back failures.
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default = "default_branch_name")]
    pub branch_name: String,
    /// Retry ceiling given to newly created issues.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failed cycles before the session pauses.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Bound on the reviewer/developer loop.
    #[serde(default = "default_review_max_iterations")]
    pub review_max_iterations: u32,
    /// Skip the design persona on fix cycles.
    #[serde(default = "default_true")]
    pub skip_design_on_fix: bool,
    /// Refuse to start without an initial goal.
    #[serde(default)]
    pub require_goal: bool,
    /// Assistant executable, absolute or looked up on PATH.
    #[serde(default = "default_assistant_binary")]
    pub assistant_binary: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Run fix and improve work through the agent pipeline.
    #[serde(default)]
    pub pipeline_mode: bool,
    /// Pause between cycles, in milliseconds.
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,
    /// Grace between SIGTERM and a forced kill, in milliseconds.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Events retained for replay to late subscribers.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_cycles() -> u32 {
    50
}

fn default_budget_usd() -> f64 {
    10.0
}

fn default_discovery_interval() -> u32 {
    10
}

fn default_review_interval() -> u32 {
    5
}

fn default_branch_name() -> String {
    "autodev".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_review_max_iterations() -> u32 {
    2
}

fn default_assistant_binary() -> String {
    "claude".to_string()
}

fn default_cycle_delay_ms() -> u64 {
    1000
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_event_buffer_size() -> usize {
    crate::events::DEFAULT_EVENT_BUFFER
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_path: None,
            test_command: None,
            max_cycles: default_max_cycles(),
            budget_usd: default_budget_usd(),
            discovery_interval: default_discovery_interval(),
            review_interval: default_review_interval(),
            auto_commit: true,
            branch_name: default_branch_name(),
            max_retries: default_max_retries(),
            max_consecutive_failures: default_max_consecutive_failures(),
            review_max_iterations: default_review_max_iterations(),
            skip_design_on_fix: true,
            require_goal: false,
            assistant_binary: default_assistant_binary(),
            model: None,
            pipeline_mode: false,
            cycle_delay_ms: default_cycle_delay_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value '{}' for setting '{}'", value, key))
}

fn parse_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl EngineConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Flattens the configuration into store settings.
    pub fn to_settings(&self) -> BTreeMap<String, String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        BTreeMap::from([
            (
                "project_path".to_string(),
                self.project_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("test_command".to_string(), opt(&self.test_command)),
            ("max_cycles".to_string(), self.max_cycles.to_string()),
            ("budget_usd".to_string(), self.budget_usd.to_string()),
            ("discovery_interval".to_string(), self.discovery_interval.to_string()),
            ("review_interval".to_string(), self.review_interval.to_string()),
            ("auto_commit".to_string(), self.auto_commit.to_string()),
            ("branch_name".to_string(), self.branch_name.clone()),
            ("max_retries".to_string(), self.max_retries.to_string()),
            (
                "max_consecutive_failures".to_string(),
                self.max_consecutive_failures.to_string(),
            ),
            (
                "review_max_iterations".to_string(),
                self.review_max_iterations.to_string(),
            ),
            ("skip_design_on_fix".to_string(), self.skip_design_on_fix.to_string()),
            ("require_goal".to_string(), self.require_goal.to_string()),
            ("assistant_binary".to_string(), self.assistant_binary.clone()),
            ("model".to_string(), opt(&self.model)),
            ("pipeline_mode".to_string(), self.pipeline_mode.to_string()),
            ("cycle_delay_ms".to_string(), self.cycle_delay_ms.to_string()),
            ("kill_grace_ms".to_string(), self.kill_grace_ms.to_string()),
            ("event_buffer_size".to_string(), self.event_buffer_size.to_string()),
        ])
    }

    /// Applies one setting. Unknown keys are ignored.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        match key {
            "project_path" => self.project_path = parse_optional(value).map(PathBuf::from),
            "test_command" => self.test_command = parse_optional(value),
            "max_cycles" => self.max_cycles = parse_value(key, value)?,
            "budget_usd" => self.budget_usd = parse_value(key, value)?,
            "discovery_interval" => self.discovery_interval = parse_value(key, value)?,
            "review_interval" => self.review_interval = parse_value(key, value)?,
            "auto_commit" => self.auto_commit = parse_value(key, value)?,
            "branch_name" => self.branch_name = value.trim().to_string(),
            "max_retries" => self.max_retries = parse_value(key, value)?,
            "max_consecutive_failures" => self.max_consecutive_failures = parse_value(key, value)?,
            "review_max_iterations" => self.review_max_iterations = parse_value(key, value)?,
            "skip_design_on_fix" => self.skip_design_on_fix = parse_value(key, value)?,
            "require_goal" => self.require_goal = parse_value(key, value)?,
            "assistant_binary" => self.assistant_binary = value.trim().to_string(),
            "model" => self.model = parse_optional(value),
            "pipeline_mode" => self.pipeline_mode = parse_value(key, value)?,
            "cycle_delay_ms" => self.cycle_delay_ms = parse_value(key, value)?,
            "kill_grace_ms" => self.kill_grace_ms = parse_value(key, value)?,
            "event_buffer_size" => self.event_buffer_size = parse_value(key, value)?,
            _ => tracing::debug!(key = %key, "ignoring unknown setting"),
        }
        Ok(())
    }

    /// Overlays store settings; unparsable values keep the current value.
    pub fn with_settings(mut self, settings: &BTreeMap<String, String>) -> Self {
        for (key, value) in settings {
            if let Err(e) = self.apply_setting(key, value) {
                tracing::warn!(error = %e, "keeping previous value");
            }
        }
        self
    }

    /// Builds a configuration from defaults plus store settings.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        Self::default().with_settings(settings)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.assistant_binary.trim().is_empty() {
            result.add_error("assistant_binary cannot be empty");
        }

        if !self.budget_usd.is_finite() || self.budget_usd < 0.0 {
            result.add_error("budget_usd must be a non-negative number");
        }

        if self.auto_commit && self.branch_name.trim().is_empty() {
            result.add_error("branch_name cannot be empty when auto_commit is enabled");
        }

        if self.max_cycles == 0 && self.budget_usd == 0.0 {
            result.add_warning("neither max_cycles nor budget_usd limits the session");
        }

        if self.max_consecutive_failures == 0 {
            result.add_warning("max_consecutive_failures of 0 pauses after the first failure");
        }

        if self.review_max_iterations > 5 {
            result.add_warning("review_max_iterations over 5 may waste budget on a stuck review");
        }

        if self.kill_grace_ms == 0 {
            result.add_warning("kill_grace_ms of 0 kills the assistant without a graceful shutdown");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
        assert_eq!(config.assistant_binary, "claude");
        assert_eq!(config.cycle_delay(), Duration::from_secs(1));
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = EngineConfig::from_toml(
            r#"
                test_command = "cargo test"
                max_cycles = 0
                budget_usd = 2.5
                pipeline_mode = true
            "#,
        )
        .unwrap();

        assert_eq!(config.test_command.as_deref(), Some("cargo test"));
        assert_eq!(config.max_cycles, 0);
        assert_eq!(config.budget_usd, 2.5);
        assert!(config.pipeline_mode);
        assert_eq!(config.review_interval, 5);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(matches!(
            EngineConfig::from_toml("max_cycles = \"many\""),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn toml_output_parses_back() {
        let mut config = EngineConfig::default();
        config.model = Some("sonnet".into());
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn settings_overlay_and_fallback() {
        let mut settings = EngineConfig::default().to_settings();
        settings.insert("max_retries".into(), "5".into());
        settings.insert("review_interval".into(), "often".into());
        settings.insert("test_command".into(), "  ".into());
        settings.insert("unknown_key".into(), "x".into());

        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.review_interval, 5);
        assert_eq!(config.test_command, None);
    }

    #[test]
    fn settings_take_precedence_over_file_values() {
        let file = EngineConfig::from_toml("max_cycles = 9\nbranch_name = \"work\"").unwrap();
        let settings = BTreeMap::from([("max_cycles".to_string(), "3".to_string())]);
        let config = file.with_settings(&settings);
        assert_eq!(config.max_cycles, 3);
        assert_eq!(config.branch_name, "work");
    }

    #[test]
    fn validation_flags_errors_and_warnings() {
        let mut config = EngineConfig::default();
        config.assistant_binary = " ".into();
        config.budget_usd = -1.0;
        config.branch_name.clear();
        config.review_max_iterations = 10;

        let result = config.validate();
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn unbounded_session_warns() {
        let mut config = EngineConfig::default();
        config.max_cycles = 0;
        config.budget_usd = 0.0;
        let result = config.validate();
        assert!(result.is_valid());
        assert_eq!(result.into_result().unwrap().len(), 1);
    }
}
