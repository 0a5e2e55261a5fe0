//! Configuration module
//!
//! Engine tuning, storage backend, logging, and the HTTP check suites and
//! webhooks the binary registers.

pub mod env;
mod file;

pub use file::CONFIG_LOCATIONS;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::JsonStorage;

/// Application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where runs are persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// HTTP check suites
    #[serde(default)]
    pub suites: Vec<CheckSuiteConfig>,

    /// Webhooks notified when a run finishes
    #[serde(default)]
    pub hooks: Vec<WebhookConfig>,
}

impl AppConfig {
    pub fn suite(&self, name: &str) -> Option<&CheckSuiteConfig> {
        self.suites.iter().find(|s| s.name == name)
    }
}

/// Orchestration engine settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the dispatcher queue
    pub queue_capacity: usize,

    /// Attempts per test when neither trigger nor suite sets one
    pub default_max_attempts: u32,

    /// Whole-suite limit when neither trigger nor suite sets one
    pub default_timeout_secs: Option<u64>,

    /// How long shutdown waits for running suites before aborting them
    pub shutdown_grace_secs: u64,

    /// Finished runs kept in the read cache
    pub retained_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            default_max_attempts: 1,
            default_timeout_secs: None,
            shutdown_grace_secs: 30,
            retained_runs: 1000,
        }
    }
}

impl EngineConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Storage backend choice
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Json,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Some(StorageBackend::Memory),
            "json" | "file" => Some(StorageBackend::Json),
            _ => None,
        }
    }
}

/// Storage settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory for the json backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured directory, or the platform data directory
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(JsonStorage::default_dir)
    }
}

/// One suite of HTTP checks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckSuiteConfig {
    pub name: String,

    /// Service label used for metrics and notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Whole-suite limit in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Trigger interval used by `serve`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_secs: Option<u64>,

    /// URL that must answer 2xx before any check runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Accept self-signed certificates
    #[serde(default)]
    pub insecure: bool,

    pub checks: Vec<CheckConfig>,
}

fn default_request_timeout() -> u64 {
    10
}

/// One HTTP check
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Failures are recorded but never fail the suite
    #[serde(default)]
    pub soft_failure: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl CheckConfig {
    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: default_method(),
            expected_status: default_expected_status(),
            body_contains: None,
            headers: BTreeMap::new(),
            soft_failure: false,
        }
    }
}

/// A webhook notified after every run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.queue_capacity, 256);
        assert_eq!(config.engine.default_max_attempts, 1);
        assert_eq!(config.engine.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_check_defaults_from_yaml() {
        let yaml = r#"
name: health
url: http://localhost:8080/healthz
"#;
        let check: CheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(check.method, "GET");
        assert_eq!(check.expected_status, 200);
        assert!(!check.soft_failure);
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::parse("JSON"), Some(StorageBackend::Json));
        assert_eq!(StorageBackend::parse("memory"), Some(StorageBackend::Memory));
        assert_eq!(StorageBackend::parse("redis"), None);
    }

    #[test]
    fn test_partial_engine_section() {
        let config: AppConfig = serde_yaml::from_str("engine:\n  retained_runs: 5\n").unwrap();
        assert_eq!(config.engine.retained_runs, 5);
        assert_eq!(config.engine.queue_capacity, 256);
    }
}
