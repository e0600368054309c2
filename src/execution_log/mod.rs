//! Append-only record of job runs.

mod models;
mod schema;
mod sqlite_execution_log;

pub use models::{JobRun, RunStart, RunStatus};
pub use schema::EXECUTION_LOG_VERSIONED_SCHEMAS;
pub use sqlite_execution_log::SqliteExecutionLog;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait ExecutionLog: Send + Sync {
    /// Open a `running` record, stamped with the current time.
    fn begin_run(&self, start: &RunStart) -> Result<JobRun>;
    /// Finalize a `running` record. Fails if the run is unknown or already final.
    fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<JobRun>;
    /// Append a run that is already finalized. Returns the new run id.
    fn append(&self, run: &JobRun) -> Result<i64>;

    /// The `limit` most recent runs across all jobs, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<JobRun>>;
    /// The `limit` most recent runs of one job, newest first.
    fn history(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>>;
    fn last_run(&self, job_name: &str) -> Result<Option<JobRun>>;
    fn last_successful(&self, job_name: &str) -> Result<Option<JobRun>>;
    fn running(&self) -> Result<Vec<JobRun>>;

    /// Fail every run still marked `running`. Called once at startup, before any
    /// worker is spawned, to close records left behind by a crash.
    fn mark_interrupted_runs(&self) -> Result<usize>;
    /// Delete finished runs whose end time is before `cutoff`.
    fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
