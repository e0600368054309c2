//! Built-in job implementations and the registry factory.

pub mod command;
pub mod history_cleanup;

pub use command::CommandJob;
pub use history_cleanup::{HistoryCleanupJob, HISTORY_CLEANUP_JOB_NAME};

use super::job::{BackgroundJob, JobDefinition, JobSchedule};
use super::registry::JobRegistry;
use crate::config::{AppConfig, JobOverride};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn apply_override(definition: &mut JobDefinition, job_override: &JobOverride) -> Result<()> {
    if let Some(enabled) = job_override.enabled {
        definition.enabled = enabled;
    }
    if let Some(secs) = job_override.interval_secs {
        if secs == 0 {
            bail!("Job {}: interval_secs must be positive", definition.name);
        }
        definition.schedule = JobSchedule::Interval(Duration::from_secs(secs));
    }
    if let Some(class) = &job_override.exclusivity_class {
        definition.exclusivity_class = class.clone();
    }
    Ok(())
}

/// Build the registry from the built-in jobs and the command jobs declared in
/// `config`, applying per-job overrides.
pub fn build_registry(config: &AppConfig) -> Result<JobRegistry> {
    let cleanup_interval_secs = config
        .history
        .cleanup_interval_hours
        .checked_mul(60 * 60)
        .context("cleanup_interval_hours is too large")?;
    let mut jobs: Vec<Arc<dyn BackgroundJob>> = vec![Arc::new(HistoryCleanupJob::new(
        config.history.retention_days,
        Duration::from_secs(cleanup_interval_secs),
    ))];
    for command_config in &config.command_jobs {
        jobs.push(Arc::new(CommandJob::from_config(command_config)?));
    }

    let mut registry = JobRegistry::new();
    for job in jobs {
        let mut definition = JobDefinition::from_job(job.as_ref());
        if let Some(job_override) = config.jobs.get(&definition.name) {
            apply_override(&mut definition, job_override)?;
        }
        registry
            .register(definition, job)
            .context("Failed to build job registry")?;
    }

    for name in config.jobs.keys() {
        if !registry.contains(name) {
            warn!("Config overrides unknown job {}, ignoring", name);
        }
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliConfig, CommandJobConfig};
    use tempfile::TempDir;

    fn app_config(temp_dir: &TempDir) -> AppConfig {
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        AppConfig::resolve(&cli, None).unwrap()
    }

    fn command_job(name: &str) -> CommandJobConfig {
        CommandJobConfig {
            name: name.to_string(),
            command: "true".to_string(),
            interval_secs: Some(900),
            ..Default::default()
        }
    }

    #[test]
    fn test_builtin_jobs_are_registered() {
        let temp_dir = TempDir::new().unwrap();
        let registry = build_registry(&app_config(&temp_dir)).unwrap();

        let cleanup = registry.lookup(HISTORY_CLEANUP_JOB_NAME).unwrap();
        assert_eq!(cleanup.definition.exclusivity_class, "maintenance");
        assert_eq!(
            cleanup.definition.schedule,
            JobSchedule::Interval(Duration::from_secs(24 * 60 * 60))
        );
    }

    #[test]
    fn test_command_jobs_follow_builtin_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = app_config(&temp_dir);
        config.command_jobs = vec![command_job("rss-sync"), command_job("disk-scan")];

        let registry = build_registry(&config).unwrap();
        let names: Vec<_> = registry.all().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec![HISTORY_CLEANUP_JOB_NAME, "rss-sync", "disk-scan"]);
    }

    #[test]
    fn test_duplicate_command_job_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = app_config(&temp_dir);
        config.command_jobs = vec![command_job("rss-sync"), command_job("rss-sync")];

        let err = build_registry(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("Job already registered: rss-sync"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = app_config(&temp_dir);
        config.command_jobs = vec![command_job("rss-sync")];
        config.jobs.insert(
            "rss-sync".to_string(),
            JobOverride {
                enabled: Some(false),
                interval_secs: Some(60),
                exclusivity_class: Some("indexers".to_string()),
            },
        );
        config.jobs.insert("ghost".to_string(), JobOverride::default());

        let registry = build_registry(&config).unwrap();
        let definition = &registry.lookup("rss-sync").unwrap().definition;
        assert!(!definition.enabled);
        assert_eq!(definition.schedule, JobSchedule::Interval(Duration::from_secs(60)));
        assert_eq!(definition.exclusivity_class, "indexers");
    }

    #[test]
    fn test_zero_interval_override_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = app_config(&temp_dir);
        config.jobs.insert(
            HISTORY_CLEANUP_JOB_NAME.to_string(),
            JobOverride {
                interval_secs: Some(0),
                ..Default::default()
            },
        );

        assert!(build_registry(&config).is_err());
    }

    #[test]
    fn test_oversized_cleanup_interval_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = app_config(&temp_dir);
        config.history.cleanup_interval_hours = u64::MAX;

        let err = build_registry(&config).unwrap_err();
        assert!(err.to_string().contains("cleanup_interval_hours is too large"));
    }
}
