use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::models::DeletePolicy;

const APP_NAME: &str = "foreman";
const CONFIG_FILE: &str = "config.json";

/// Runtime configuration, persisted as JSON in the user's config directory.
/// Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. Defaults to `<data_dir>/foreman/foreman.db`.
    pub database_path: Option<PathBuf>,
    /// Parent directory for default task scopes. Defaults to the current
    /// directory.
    pub workspace_root: Option<PathBuf>,
    pub runner: RunnerConfig,
    pub scheduler: SchedulerConfig,
    pub tracker: TrackerConfig,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub delete_policy: DeletePolicy,
}

/// Budgets for the per-task execution loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_iterations: u32,
    /// Wall-clock budget for a whole task.
    pub task_timeout_secs: u64,
    /// Budget for a single reasoning call.
    pub reasoning_timeout_secs: u64,
    /// Attempts per round before the task fails.
    pub reasoning_retries: u32,
    /// Pause before retrying a transient failure; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Lines kept from each declared read file.
    pub context_line_budget: usize,
    /// Scope violations tolerated before the worker is stopped.
    pub scope_violation_limit: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            task_timeout_secs: 1800,
            reasoning_timeout_secs: 180,
            reasoning_retries: 3,
            retry_backoff_ms: 2000,
            context_line_budget: 200,
            scope_violation_limit: 3,
        }
    }
}

impl RunnerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Lifetime of the scheduler lease; it is renewed at a third of this.
    pub lease_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            lease_ttl_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Size of each task's recent-event ring buffer.
    pub recent_events: usize,
    /// Flush a task's record after this many mutations.
    pub checkpoint_every: u32,
    /// Background flush period.
    pub checkpoint_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recent_events: 10,
            checkpoint_every: 5,
            checkpoint_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            requests_per_hour: 1000,
        }
    }
}

/// Command-line reasoning client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            model: None,
            timeout_secs: 180,
        }
    }
}

impl Config {
    /// Load configuration from the user's config directory.
    /// Returns default config if the file doesn't exist or fails to parse.
    pub fn load() -> Self {
        match get_config_path().and_then(|path| Self::try_load(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            }
        }
    }

    /// Load an explicitly named file. Unlike [`Config::load`], a missing or
    /// broken file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        Self::try_load(path)
    }

    fn try_load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config = serde_json::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn get_config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}
