//! Execution history cleanup background job.
//!
//! Deletes finished runs older than the configured retention period.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use chrono::Utc;
use std::time::Duration;
use tracing::info;

pub const HISTORY_CLEANUP_JOB_NAME: &str = "history-cleanup";

pub struct HistoryCleanupJob {
    retention_days: u64,
    interval: Duration,
}

impl HistoryCleanupJob {
    pub fn new(retention_days: u64, interval: Duration) -> Self {
        Self {
            retention_days,
            interval,
        }
    }
}

impl BackgroundJob for HistoryCleanupJob {
    fn name(&self) -> &str {
        HISTORY_CLEANUP_JOB_NAME
    }

    fn description(&self) -> &str {
        "Delete job run history older than the retention period"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn exclusivity_class(&self) -> &str {
        "maintenance"
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        // Cleanup can happen next run
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if self.retention_days == 0 {
            return Err(JobError::Skipped("History retention is disabled".to_string()));
        }

        let cutoff = i64::try_from(self.retention_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| {
                JobError::ExecutionFailed(format!(
                    "Retention of {} days is out of range",
                    self.retention_days
                ))
            })?;
        info!(
            "Cleaning up job runs older than {} days (cutoff: {})",
            self.retention_days,
            cutoff.to_rfc3339()
        );

        let deleted = ctx
            .execution_log
            .prune_finished_before(cutoff)
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!("Deleted {} old job runs", deleted);
        } else {
            info!("No job runs to clean up");
        }
        Ok(())
    }
}
