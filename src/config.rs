//! Runtime configuration loaded from TOML
//!
//! Each section maps onto one receiver or service. Receivers themselves only
//! see opaque `key -> value` settings; `*_settings()` helpers render a section
//! into that form so parsing and validation stay with the receiver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub batch: BatchSection,
    pub http: Option<HttpSection>,
    /// Directory pickup targets, each scheduled independently
    #[serde(default)]
    pub pickup: Vec<PickupTarget>,
    #[serde(default)]
    pub health: HealthSection,
}

/// Runtime identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    /// Runtime identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Name of the pipeline driven by the default agent
    #[serde(default = "default_pipeline_name")]
    pub pipeline: String,
}

fn default_pipeline_name() -> String {
    "receive".to_string()
}

/// Interval scheduler defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSection {
    /// Minimum interval between polls of one target, in seconds
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: f64,
    /// Upper bound the backoff grows to, in seconds
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
    /// Wait used when nothing is scheduled, in milliseconds
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

fn default_min_interval_secs() -> f64 {
    5.0
}

fn default_max_interval_secs() -> f64 {
    300.0
}

fn default_idle_wait_ms() -> u64 {
    1000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

/// Batch polling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSection {
    /// Sleep between polls that found no work, in milliseconds
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
}

fn default_polling_interval_ms() -> u64 {
    1000
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
        }
    }
}

/// HTTP receiver settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    /// Socket address to listen on
    pub bind_address: String,
    /// Maximum number of concurrently pending accepts
    #[serde(default = "default_max_concurrent_accepts")]
    pub max_concurrent_accepts: usize,
    /// Path accepted by the message submission handler, with its sub-paths
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
    /// Time open connections get to finish on shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_concurrent_accepts() -> usize {
    16
}

fn default_submit_path() -> String {
    "/messages".to_string()
}

/// How a pickup directory is polled
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PickupMode {
    /// Shared scheduled receiver with per-target backoff
    #[default]
    Scheduled,
    /// Own batch receiver using the `[batch]` polling interval
    Batch,
}

/// One directory polled for message files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PickupTarget {
    /// Stable schedule key
    pub key: String,
    pub directory: PathBuf,
    #[serde(default)]
    pub mode: PickupMode,
    /// Overrides `[scheduler].min_interval_secs` (scheduled mode only)
    pub min_interval_secs: Option<f64>,
    /// Overrides `[scheduler].max_interval_secs` (scheduled mode only)
    pub max_interval_secs: Option<f64>,
}

/// Health server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid runtime ID format: {0}")]
    InvalidRuntimeId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RuntimeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_runtime_id(&self.runtime.id)?;

        let mut keys = std::collections::HashSet::new();
        for target in &self.pickup {
            if target.key.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "pickup target key must not be empty".to_string(),
                ));
            }
            if !keys.insert(target.key.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate pickup target key '{}'",
                    target.key
                )));
            }
            for secs in [target.min_interval_secs, target.max_interval_secs]
                .into_iter()
                .flatten()
            {
                validate_interval_secs(&target.key, secs)?;
            }
        }

        validate_interval_secs("[scheduler]", self.scheduler.min_interval_secs)?;
        validate_interval_secs("[scheduler]", self.scheduler.max_interval_secs)?;

        if self.batch.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "[batch].polling_interval_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(http) = &self.http {
            if http.max_concurrent_accepts == 0 {
                return Err(ConfigError::InvalidConfig(
                    "[http].max_concurrent_accepts must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Settings map for the scheduled pickup receiver
    pub fn scheduler_settings(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "min_interval_secs".to_string(),
                self.scheduler.min_interval_secs.to_string(),
            ),
            (
                "max_interval_secs".to_string(),
                self.scheduler.max_interval_secs.to_string(),
            ),
            (
                "idle_wait_ms".to_string(),
                self.scheduler.idle_wait_ms.to_string(),
            ),
        ])
    }

    /// Pickup targets polled with the given mode, in file order
    pub fn pickups(&self, mode: PickupMode) -> impl Iterator<Item = &PickupTarget> {
        self.pickup.iter().filter(move |target| target.mode == mode)
    }

    /// Settings map for batch polling receivers
    pub fn batch_settings(&self) -> HashMap<String, String> {
        HashMap::from([(
            "polling_interval_ms".to_string(),
            self.batch.polling_interval_ms.to_string(),
        )])
    }

    /// Settings map for the HTTP receiver, if configured
    pub fn http_settings(&self) -> Option<HashMap<String, String>> {
        self.http.as_ref().map(|http| {
            HashMap::from([
                ("bind_address".to_string(), http.bind_address.clone()),
                (
                    "max_concurrent_accepts".to_string(),
                    http.max_concurrent_accepts.to_string(),
                ),
                ("submit_path".to_string(), http.submit_path.clone()),
                (
                    "shutdown_grace_ms".to_string(),
                    http.shutdown_grace_ms.to_string(),
                ),
            ])
        })
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[runtime]
id = "test-runtime"

[http]
bind_address = "127.0.0.1:0"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate runtime ID format
fn validate_runtime_id(runtime_id: &str) -> Result<(), ConfigError> {
    let valid_chars = runtime_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if runtime_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidRuntimeId(format!(
            "Runtime ID '{runtime_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

/// Interval settings must be finite and non-negative seconds
fn validate_interval_secs(owner: &str, secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{owner}: interval {secs} must be a non-negative number of seconds"
        )));
    }
    Ok(())
}
