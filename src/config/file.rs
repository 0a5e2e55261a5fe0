//! Configuration file management
//!
//! Handles finding, loading, and validating configuration files.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{AppConfig, CheckConfig, CheckSuiteConfig, EngineConfig, StorageConfig, WebhookConfig};

/// Configuration file locations (in order of precedence)
pub const CONFIG_LOCATIONS: &[&str] = &[
    "./suite-runner.yaml",
    "./suite-runner.yml",
    "./.suite-runner.yaml",
    "~/.config/suite-runner/config.yaml",
    "~/.suite-runner.yaml",
];

impl AppConfig {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load from the first standard location, or defaults
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.queue_capacity == 0 {
            bail!("engine.queue_capacity must be at least 1");
        }
        if self.engine.default_max_attempts == 0 {
            bail!("engine.default_max_attempts must be at least 1");
        }

        let mut suites = HashSet::new();
        for suite in &self.suites {
            if suite.name.trim().is_empty() {
                bail!("Suite name must not be empty");
            }
            if !suites.insert(suite.name.as_str()) {
                bail!("Suite '{}' is defined twice", suite.name);
            }
            if suite.checks.is_empty() {
                bail!("Suite '{}' has no checks", suite.name);
            }
            if suite.schedule_secs == Some(0) {
                bail!("Suite '{}': schedule_secs must be positive", suite.name);
            }
            if let Some(setup) = &suite.setup {
                check_url(setup).with_context(|| format!("Suite '{}' setup", suite.name))?;
            }

            let mut checks = HashSet::new();
            for check in &suite.checks {
                if !checks.insert(check.name.as_str()) {
                    bail!("Check '{}' is defined twice in suite '{}'", check.name, suite.name);
                }
                check_url(&check.url)
                    .with_context(|| format!("Check '{}' in suite '{}'", check.name, suite.name))?;
                if !(100..=599).contains(&check.expected_status) {
                    bail!(
                        "Check '{}' in suite '{}': invalid expected_status {}",
                        check.name,
                        suite.name,
                        check.expected_status
                    );
                }
            }
        }

        for hook in &self.hooks {
            check_url(&hook.url).with_context(|| format!("Hook '{}'", hook.name))?;
        }

        Ok(())
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let mut body_check = CheckConfig::get("version", "http://localhost:8080/version");
        body_check.body_contains = Some("\"version\"".to_string());

        let mut soft_check = CheckConfig::get("metrics", "http://localhost:8080/metrics");
        soft_check.soft_failure = true;

        Self {
            engine: EngineConfig {
                default_max_attempts: 2,
                default_timeout_secs: Some(120),
                ..EngineConfig::default()
            },
            storage: StorageConfig::default(),
            log_level: Some("info".to_string()),
            suites: vec![CheckSuiteConfig {
                name: "api-smoke".to_string(),
                service: Some("api".to_string()),
                max_attempts: Some(3),
                timeout_secs: Some(60),
                schedule_secs: Some(300),
                setup: Some("http://localhost:8080/healthz".to_string()),
                request_timeout_secs: 10,
                insecure: false,
                checks: vec![
                    CheckConfig::get("healthz", "http://localhost:8080/healthz"),
                    body_check,
                    soft_check,
                ],
            }],
            hooks: vec![WebhookConfig {
                name: "chat".to_string(),
                url: "https://chat.example.com/hooks/suite-runner".to_string(),
                timeout_secs: 10,
            }],
        }
    }
}

fn check_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        bail!("URL must start with http:// or https://: {url}")
    }
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
