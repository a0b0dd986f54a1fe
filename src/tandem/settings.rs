// SPDX-License-Identifier: MIT

//! Settings loader - YAML file and environment configuration
//!
//! Every field is optional in the file; missing ones keep the engine
//! defaults. Environment variables win over the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::{Result, TandemError};
use crate::adk::session::SessionFactory;
use crate::tandem::subagent::{SubagentGraphBridge, DEFAULT_MAX_OUTPUT_CHARS};
use crate::tandem::workflow::graph::{
    GraphConfig, RetryConfig, DEFAULT_CONTEXT_WINDOW_THRESHOLD, DEFAULT_MAX_NODE_VISITS,
    DEFAULT_MAX_STEPS, DEFAULT_MODEL_ENV,
};

/// Overrides `max_steps`
pub const MAX_STEPS_ENV: &str = "TANDEM_MAX_STEPS";

/// Default retry policy as written in the settings file
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            multiplier: retry.multiplier,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            settings.multiplier,
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    /// Sub-agent output is truncated to this many characters
    pub max_output_chars: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

/// Engine limits and defaults
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GraphSettings {
    pub max_steps: usize,
    pub max_node_visits: usize,
    /// Percentage of the context window that counts as full
    pub context_window_threshold: f64,
    pub default_model: Option<String>,
    pub retry: RetrySettings,
    pub bridge: BridgeSettings,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
            context_window_threshold: DEFAULT_CONTEXT_WINDOW_THRESHOLD,
            default_model: None,
            retry: RetrySettings::default(),
            bridge: BridgeSettings::default(),
        }
    }
}

impl GraphSettings {
    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(MAX_STEPS_ENV) {
            self.max_steps = raw.trim().parse().map_err(|_| {
                TandemError::config(format!(
                    "{} must be a positive integer, got '{}'",
                    MAX_STEPS_ENV, raw
                ))
            })?;
            log::debug!("max_steps overridden to {} from environment", self.max_steps);
        }
        if let Some(model) = lookup(DEFAULT_MODEL_ENV).filter(|m| !m.trim().is_empty()) {
            log::debug!("default_model overridden to '{}' from environment", model);
            self.default_model = Some(model);
        }
        Ok(self)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(TandemError::config("max_steps must be greater than zero"));
        }
        if self.max_node_visits == 0 {
            return Err(TandemError::config("max_node_visits must be greater than zero"));
        }
        if !(self.context_window_threshold > 0.0 && self.context_window_threshold <= 100.0) {
            return Err(TandemError::config(format!(
                "context_window_threshold must be within (0, 100], got {}",
                self.context_window_threshold
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(TandemError::config("retry.multiplier must be at least 1.0"));
        }
        Ok(())
    }

    /// Graph configuration carrying these limits; runtime dependencies are
    /// left for the caller to attach
    pub fn to_config(&self) -> GraphConfig {
        let mut config = GraphConfig::new()
            .with_max_steps(self.max_steps)
            .with_max_node_visits(self.max_node_visits)
            .with_context_window_threshold(self.context_window_threshold)
            .with_default_retry(RetryConfig::from(&self.retry));
        if let Some(model) = &self.default_model {
            config = config.with_default_model(model.clone());
        }
        config
    }

    pub fn build_bridge(&self, factory: Arc<dyn SessionFactory>) -> SubagentGraphBridge {
        SubagentGraphBridge::new(factory).with_max_output_chars(self.bridge.max_output_chars)
    }
}

/// Loads [`GraphSettings`] from YAML files
pub struct SettingsLoader;

impl SettingsLoader {
    /// Load, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<GraphSettings> {
        let path = path.as_ref();
        log::info!("Loading settings from {}", path.display());
        let content = fs::read_to_string(path)?;
        let settings = Self::parse_yaml(&content)?.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string without consulting the environment
    pub fn parse_yaml(content: &str) -> Result<GraphSettings> {
        if content.trim().is_empty() {
            return Ok(GraphSettings::default());
        }
        let settings: GraphSettings = serde_yaml::from_str(content)
            .map_err(|e| TandemError::config(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_full_settings() {
        let yaml = r#"
max_steps: 50
max_node_visits: 7
context_window_threshold: 75.5
default_model: sonnet
retry:
  max_attempts: 5
  base_delay_ms: 200
  multiplier: 1.5
bridge:
  max_output_chars: 1200
"#;
        let settings = SettingsLoader::parse_yaml(yaml).unwrap();
        assert_eq!(settings.max_steps, 50);
        assert_eq!(settings.max_node_visits, 7);
        assert_eq!(settings.default_model.as_deref(), Some("sonnet"));
        assert_eq!(settings.bridge.max_output_chars, 1200);

        let config = settings.to_config();
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.context_window_threshold, 75.5);
        assert_eq!(config.default_retry.max_attempts, 5);
        assert_eq!(config.default_retry.base_delay, Duration::from_millis(200));
        assert_eq!(config.default_model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_missing_fields_keep_defaults() {
        let settings = SettingsLoader::parse_yaml("max_steps: 20\n").unwrap();
        assert_eq!(settings.max_steps, 20);
        assert_eq!(settings.max_node_visits, DEFAULT_MAX_NODE_VISITS);
        assert_eq!(settings.retry, RetrySettings::default());
        assert_eq!(SettingsLoader::parse_yaml("").unwrap(), GraphSettings::default());
    }

    #[test]
    fn test_invalid_settings_are_config_errors() {
        let err = SettingsLoader::parse_yaml("max_steps: many\n").unwrap_err();
        assert!(matches!(err, TandemError::Config(_)));

        let err = SettingsLoader::parse_yaml("context_window_threshold: 140\n").unwrap_err();
        assert!(err.to_string().contains("context_window_threshold"));

        let err = SettingsLoader::parse_yaml("max_steps: 0\n").unwrap_err();
        assert!(matches!(err, TandemError::Config(_)));
    }

    #[test]
    fn test_environment_overrides() {
        let settings = GraphSettings::default()
            .apply_overrides(env(&[(MAX_STEPS_ENV, "42"), (DEFAULT_MODEL_ENV, "haiku")]))
            .unwrap();
        assert_eq!(settings.max_steps, 42);
        assert_eq!(settings.default_model.as_deref(), Some("haiku"));

        let untouched = GraphSettings::default().apply_overrides(env(&[])).unwrap();
        assert_eq!(untouched, GraphSettings::default());

        let err = GraphSettings::default()
            .apply_overrides(env(&[(MAX_STEPS_ENV, "-3")]))
            .unwrap_err();
        assert!(err.to_string().contains(MAX_STEPS_ENV));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_node_visits: 3").unwrap();
        writeln!(file, "bridge:\n  max_output_chars: 10").unwrap();

        let settings = SettingsLoader::load(file.path()).unwrap();
        assert_eq!(settings.max_node_visits, 3);
        assert_eq!(settings.bridge.max_output_chars, 10);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SettingsLoader::load("/nonexistent/tandem.yaml").unwrap_err();
        assert!(matches!(err, TandemError::Io(_)));
    }
}
