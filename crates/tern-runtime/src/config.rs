//! Runtime Configuration
//!
//! TOML-backed settings for the shared environment and for each event loop.
//! Every field has a default so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub event_loop: LoopConfig,
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded runtime configuration from: {}", path.display());
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.async_worker_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "environment.async_worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.environment.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "environment.max_blocking_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.event_loop.max_poll_events == 0 {
            return Err(ConfigError::Invalid {
                field: "event_loop.max_poll_events",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for the environment shared by every loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Core threads of the async worker pool
    #[serde(default = "default_async_worker_threads")]
    pub async_worker_threads: usize,
    /// Upper bound on threads running blocking work for guests
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    /// Idle time before a blocking thread is reclaimed
    #[serde(default = "default_blocking_keep_alive_secs")]
    pub blocking_keep_alive_secs: u64,
    /// Name given to pool threads
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            async_worker_threads: default_async_worker_threads(),
            max_blocking_threads: default_max_blocking_threads(),
            blocking_keep_alive_secs: default_blocking_keep_alive_secs(),
            thread_name: default_thread_name(),
        }
    }
}

impl EnvironmentConfig {
    pub fn blocking_keep_alive(&self) -> Duration {
        Duration::from_secs(self.blocking_keep_alive_secs)
    }
}

fn default_async_worker_threads() -> usize {
    2
}

fn default_max_blocking_threads() -> usize {
    1000
}

fn default_blocking_keep_alive_secs() -> u64 {
    60
}

fn default_thread_name() -> String {
    "tern-async".to_string()
}

/// Settings for a single event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Wall-clock budget for each dispatched unit, in milliseconds
    #[serde(default)]
    pub script_time_limit_ms: Option<u64>,
    /// Poll timeout when nothing is scheduled; absent means wait indefinitely
    #[serde(default)]
    pub idle_poll_timeout_ms: Option<u64>,
    /// Refuse unpaired unpin calls instead of logging them
    #[serde(default)]
    pub strict_pin_accounting: bool,
    /// Capacity of the readiness event buffer
    #[serde(default = "default_max_poll_events")]
    pub max_poll_events: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            script_time_limit_ms: None,
            idle_poll_timeout_ms: None,
            strict_pin_accounting: false,
            max_poll_events: default_max_poll_events(),
        }
    }
}

impl LoopConfig {
    pub fn script_time_limit(&self) -> Option<Duration> {
        self.script_time_limit_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_poll_timeout(&self) -> Option<Duration> {
        self.idle_poll_timeout_ms.map(Duration::from_millis)
    }
}

fn default_max_poll_events() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.environment.async_worker_threads, 2);
        assert_eq!(config.environment.max_blocking_threads, 1000);
        assert_eq!(config.environment.thread_name, "tern-async");
        assert_eq!(config.event_loop.max_poll_events, 64);
        assert!(!config.event_loop.strict_pin_accounting);
        assert_eq!(config.event_loop.script_time_limit(), None);
        assert_eq!(config.event_loop.idle_poll_timeout(), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tern.toml");
        std::fs::write(
            &path,
            r#"
[environment]
async_worker_threads = 4
thread_name = "guest-io"

[event_loop]
script_time_limit_ms = 250
strict_pin_accounting = true
"#,
        )
        .unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.environment.async_worker_threads, 4);
        assert_eq!(config.environment.thread_name, "guest-io");
        assert_eq!(
            config.event_loop.script_time_limit(),
            Some(Duration::from_millis(250))
        );
        assert!(config.event_loop.strict_pin_accounting);
    }

    #[test]
    fn test_zero_time_limit_means_unlimited() {
        let config = RuntimeConfig::from_toml_str("[event_loop]\nscript_time_limit_ms = 0\n").unwrap();
        assert_eq!(config.event_loop.script_time_limit(), None);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = RuntimeConfig::from_toml_str("[environment]\nasync_worker_threads = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = RuntimeConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
