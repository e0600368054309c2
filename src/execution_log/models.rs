use crate::background_jobs::JobParams;
use chrono::{DateTime, Utc};

/// Status of a job run.
///
/// A run is created as `Running` and moves exactly once to one of the
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Everything needed to open a new run record.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub job_name: String,
    pub request_id: Option<String>,
    /// How the job was triggered: "schedule", "retry" or "manual".
    pub triggered_by: String,
    pub params: JobParams,
}

/// One execution of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub request_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub params: JobParams,
}

impl JobRun {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.started_at)
    }
}
