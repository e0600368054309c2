use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub retry: Option<RetryConfig>,
    pub history: Option<HistoryConfig>,
    /// Per-job overrides, keyed by job name.
    pub jobs: HashMap<String, JobOverride>,
    pub command_jobs: Vec<CommandJobConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub worker_count: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    /// Set to 0 to keep history forever.
    pub retention_days: Option<u64>,
    pub cleanup_interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct JobOverride {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub exclusivity_class: Option<String>,
}

/// An external program run as a job.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CommandJobConfig {
    pub name: String,
    pub description: Option<String>,
    /// Command line, split with shell quoting rules. No shell is involved.
    pub command: String,
    /// Omit for a manual-only job.
    pub interval_secs: Option<u64>,
    pub exclusivity_class: Option<String>,
    pub working_dir: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Kill the program at shutdown instead of waiting for it.
    pub cancellable: bool,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
