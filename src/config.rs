use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Engine configuration, read from `~/.cadence/cadence.toml`.
///
/// Every field has a default so a partial file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global concurrency limit for task executions.
    pub max_concurrent_tasks: usize,
    /// How many times a failed task is retried before it stays failed.
    pub retry_attempts: u32,
    /// Base retry delay; the nth retry waits `retry_delay_ms * n`.
    pub retry_delay_ms: u64,
    /// Executor deadline when the caller supplies none.
    pub default_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Tasks in progress for longer than this are reported as stuck.
    pub stuck_threshold_secs: u64,
    /// failed / created above this ratio is a critical health condition.
    pub failure_rate_threshold: f64,
    /// Completed tasks older than this are evicted from memory.
    pub retention_days: i64,
    /// Execution history entries kept per persisted task.
    pub history_limit: usize,
    pub event_capacity: usize,
    pub sync_queue_capacity: usize,
    /// SQLite database file. In-memory store when unset.
    pub database_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            default_timeout_secs: 30,
            health_check_interval_secs: 60,
            stuck_threshold_secs: 3600,
            failure_rate_threshold: 0.1,
            retention_days: 30,
            history_limit: 50,
            event_capacity: 1024,
            sync_queue_capacity: 256,
            database_path: None,
        }
    }
}

impl EngineConfig {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path.as_deref().map(expand_tilde)
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrent = config.max_concurrent_tasks,
            retry_attempts = config.retry_attempts,
            database = ?config.database_path,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Validation(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(Error::Validation(format!(
                "failure_rate_threshold must be within 0..=1, got {}",
                self.failure_rate_threshold
            )));
        }
        if self.history_limit == 0 {
            return Err(Error::Validation(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
