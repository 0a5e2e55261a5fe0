//! Environment variable configuration
//!
//! `SUITE_RUNNER_*` variables override the configuration file.

use std::env;
use std::path::PathBuf;

use super::{AppConfig, StorageBackend};

/// Environment variable prefix
const ENV_PREFIX: &str = "SUITE_RUNNER";

/// Overrides read from the environment
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from SUITE_RUNNER_CONFIG
    pub config_file: Option<String>,
    /// Log level from SUITE_RUNNER_LOG
    pub log: Option<String>,
    /// Storage backend from SUITE_RUNNER_STORAGE
    pub storage: Option<String>,
    /// Storage directory from SUITE_RUNNER_STORAGE_DIR
    pub storage_dir: Option<String>,
    /// Default attempts from SUITE_RUNNER_MAX_ATTEMPTS
    pub max_attempts: Option<u32>,
    /// Queue capacity from SUITE_RUNNER_QUEUE_CAPACITY
    pub queue_capacity: Option<usize>,
    /// Shutdown grace from SUITE_RUNNER_GRACE_SECS
    pub grace_secs: Option<u64>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            log: get_env("LOG"),
            storage: get_env("STORAGE"),
            storage_dir: get_env("STORAGE_DIR"),
            max_attempts: get_env_parse("MAX_ATTEMPTS"),
            queue_capacity: get_env_parse("QUEUE_CAPACITY"),
            grace_secs: get_env_parse("GRACE_SECS"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.config_file.is_some()
            || self.log.is_some()
            || self.storage.is_some()
            || self.storage_dir.is_some()
            || self.max_attempts.is_some()
            || self.queue_capacity.is_some()
            || self.grace_secs.is_some()
    }

    /// Apply overrides on top of a loaded configuration
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(log) = &self.log {
            // Full filter directives are handled by the logger itself.
            if !log.contains('=') {
                config.log_level = Some(log.clone());
            }
        }
        if let Some(backend) = self.storage.as_deref().and_then(StorageBackend::parse) {
            config.storage.backend = backend;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage.dir = Some(PathBuf::from(dir));
        }
        if let Some(attempts) = self.max_attempts {
            config.engine.default_max_attempts = attempts.max(1);
        }
        if let Some(capacity) = self.queue_capacity {
            config.engine.queue_capacity = capacity.max(1);
        }
        if let Some(grace) = self.grace_secs {
            config.engine.shutdown_grace_secs = grace;
        }
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONFIG:          {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_LOG:             {:?}", ENV_PREFIX, self.log);
        println!("  {}_STORAGE:         {:?}", ENV_PREFIX, self.storage);
        println!("  {}_STORAGE_DIR:     {:?}", ENV_PREFIX, self.storage_dir);
        println!("  {}_MAX_ATTEMPTS:    {:?}", ENV_PREFIX, self.max_attempts);
        println!("  {}_QUEUE_CAPACITY:  {:?}", ENV_PREFIX, self.queue_capacity);
        println!("  {}_GRACE_SECS:      {:?}", ENV_PREFIX, self.grace_secs);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Builder for setting environment variables (useful for testing)
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn config_file(self, path: impl Into<String>) -> Self {
        self.var("CONFIG", path.into())
    }

    pub fn log(self, level: impl Into<String>) -> Self {
        self.var("LOG", level.into())
    }

    pub fn storage(self, backend: impl Into<String>) -> Self {
        self.var("STORAGE", backend.into())
    }

    pub fn storage_dir(self, dir: impl Into<String>) -> Self {
        self.var("STORAGE_DIR", dir.into())
    }

    pub fn max_attempts(self, attempts: u32) -> Self {
        self.var("MAX_ATTEMPTS", attempts)
    }

    pub fn queue_capacity(self, capacity: usize) -> Self {
        self.var("QUEUE_CAPACITY", capacity)
    }

    pub fn grace_secs(self, secs: u64) -> Self {
        self.var("GRACE_SECS", secs)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all SUITE_RUNNER environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG          Path to configuration file");
    println!("  {ENV_PREFIX}_LOG             Log level or tracing filter directives");
    println!("  {ENV_PREFIX}_STORAGE         Storage backend (memory, json)");
    println!("  {ENV_PREFIX}_STORAGE_DIR     Directory for the json backend");
    println!("  {ENV_PREFIX}_MAX_ATTEMPTS    Default attempts per test");
    println!("  {ENV_PREFIX}_QUEUE_CAPACITY  Dispatcher queue capacity");
    println!("  {ENV_PREFIX}_GRACE_SECS      Shutdown grace period in seconds");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_STORAGE=json");
    println!("  export {ENV_PREFIX}_MAX_ATTEMPTS=3");
    println!("  suite-runner serve");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(!config.has_any());
        assert!(config.storage.is_none());
    }

    // Single test so scoped variables never race with another test.
    #[test]
    fn test_env_builder_and_apply() {
        let _guard = EnvBuilder::new()
            .storage("json")
            .storage_dir("/tmp/runs")
            .max_attempts(0)
            .queue_capacity(64)
            .grace_secs(5)
            .log("debug")
            .apply_scoped();

        let env = EnvConfig::load();
        assert!(env.has_any());
        assert_eq!(env.queue_capacity, Some(64));

        let mut config = AppConfig::default();
        env.apply(&mut config);
        assert_eq!(config.storage.backend, StorageBackend::Json);
        assert_eq!(config.storage.dir, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.engine.default_max_attempts, 1);
        assert_eq!(config.engine.queue_capacity, 64);
        assert_eq!(config.engine.shutdown_grace_secs, 5);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_filter_directives_leave_log_level() {
        let env = EnvConfig {
            log: Some("suite_runner=trace".to_string()),
            ..Default::default()
        };
        let mut config = AppConfig::default();
        env.apply(&mut config);
        assert!(config.log_level.is_none());
    }
}
