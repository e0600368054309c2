mod file_config;

pub use file_config::{
    CommandJobConfig, FileConfig, HistoryConfig, JobOverride, RetryConfig, SchedulerConfig,
};

use crate::background_jobs::{OrchestratorSettings, RetryPolicy};
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const MAX_RETENTION_DAYS: u64 = 100 * 365;
const MAX_CLEANUP_INTERVAL_HOURS: u64 = 365 * 24;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub tick_interval_secs: u64,
    pub worker_count: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            port: 3001,
            metrics_port: 9091,
            logging_level: RequestsLoggingLevel::default(),
            tick_interval_secs: SchedulerSettings::default().tick_interval_secs,
            worker_count: SchedulerSettings::default().worker_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub history: HistorySettings,
    pub jobs: HashMap<String, JobOverride>,
    pub command_jobs: Vec<CommandJobConfig>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let scheduler_file = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            tick_interval_secs: scheduler_file
                .tick_interval_secs
                .unwrap_or(cli.tick_interval_secs),
            worker_count: scheduler_file.worker_count.unwrap_or(cli.worker_count),
            shutdown_timeout_secs: scheduler_file
                .shutdown_timeout_secs
                .unwrap_or(SchedulerSettings::default().shutdown_timeout_secs),
        };
        if scheduler.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        if scheduler.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }

        let retry_defaults = RetrySettings::default();
        let retry_file = file.retry.unwrap_or_default();
        let retry = RetrySettings {
            max_retries: retry_file.max_retries.unwrap_or(retry_defaults.max_retries),
            initial_backoff_secs: retry_file
                .initial_backoff_secs
                .unwrap_or(retry_defaults.initial_backoff_secs),
            max_backoff_secs: retry_file
                .max_backoff_secs
                .unwrap_or(retry_defaults.max_backoff_secs),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        };
        if retry.backoff_multiplier < 1.0 {
            bail!("backoff_multiplier must be at least 1.0");
        }

        let history_defaults = HistorySettings::default();
        let history_file = file.history.unwrap_or_default();
        let history = HistorySettings {
            retention_days: history_file
                .retention_days
                .unwrap_or(history_defaults.retention_days),
            cleanup_interval_hours: history_file
                .cleanup_interval_hours
                .unwrap_or(history_defaults.cleanup_interval_hours),
        };
        if history.retention_days > MAX_RETENTION_DAYS {
            bail!("retention_days must be at most {}", MAX_RETENTION_DAYS);
        }
        if history.cleanup_interval_hours == 0 {
            bail!("cleanup_interval_hours must be positive");
        }
        if history.cleanup_interval_hours > MAX_CLEANUP_INTERVAL_HOURS {
            bail!(
                "cleanup_interval_hours must be at most {}",
                MAX_CLEANUP_INTERVAL_HOURS
            );
        }

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            logging_level,
            scheduler,
            retry,
            history,
            jobs: file.jobs,
            command_jobs: file.command_jobs,
        })
    }

    pub fn execution_log_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_secs),
            worker_count: self.scheduler.worker_count,
            shutdown_timeout: Duration::from_secs(self.scheduler.shutdown_timeout_secs),
            retry_policy: RetryPolicy::new(&self.retry),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    pub worker_count: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            worker_count: 1,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySettings {
    pub retention_days: u64,
    pub cleanup_interval_hours: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
