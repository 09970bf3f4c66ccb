use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::Phase;

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: FlowConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Node runs allowed per invocation (0 = unlimited).
    #[serde(default)]
    pub max_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// State key the current batch item is stored under.
    #[serde(default = "default_item_key")]
    pub item_key: String,
    /// How long the parallel orchestrator waits for its item tasks.
    #[serde(default = "default_parallel_timeout_ms")]
    pub parallel_timeout_ms: u64,
    /// Concurrent item tasks (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            item_key: default_item_key(),
            parallel_timeout_ms: default_parallel_timeout_ms(),
            max_concurrency: 0,
        }
    }
}

impl BatchConfig {
    pub fn parallel_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_timeout_ms)
    }
}

fn default_item_key() -> String { "current_item".to_string() }
fn default_parallel_timeout_ms() -> u64 { 30_000 }

/// Backoff and strategy table for error recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default)]
    pub rules: Vec<RecoveryRule>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
            rules: Vec::new(),
        }
    }
}

fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_jitter() -> bool { true }

/// One `[[recovery.rules]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRule {
    /// Error category label (e.g. "timeout", "network", or a custom label).
    pub category: String,
    pub phase: Phase,
    pub action: RuleAction,
    /// Attempts for `retry` rules.
    #[serde(default = "default_rule_attempts")]
    pub attempts: u32,
}

fn default_rule_attempts() -> u32 { 3 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

fn default_store_backend() -> String { "memory".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
    /// Completed records held before the oldest are evicted (0 = unbounded).
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
            max_records: default_max_records(),
        }
    }
}

fn default_monitoring_enabled() -> bool { true }

fn default_max_records() -> usize { 1000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
