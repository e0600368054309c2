use super::context::JobContext;
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque key-value parameters attached to a job request.
pub type JobParams = BTreeMap<String, String>;

/// When a job should be scheduled to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSchedule {
    /// Run at fixed intervals, measured from the start of the last successful run.
    /// A job that never succeeded is due immediately.
    Interval(Duration),
    /// Run only when explicitly triggered.
    Manual,
}

impl JobSchedule {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            JobSchedule::Interval(interval) => Some(*interval),
            JobSchedule::Manual => None,
        }
    }
}

/// How a job should be handled during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// The job's cancellation token is cancelled on shutdown.
    #[default]
    Cancellable,
    /// The job is left to finish on its own.
    WaitForCompletion,
}

/// Errors a job body can report.
#[derive(Debug)]
pub enum JobError {
    ExecutionFailed(String),
    Cancelled,
    /// The job decided there was nothing to do.
    Skipped(String),
    Timeout(Duration),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            JobError::Cancelled => write!(f, "Job was cancelled"),
            JobError::Skipped(reason) => write!(f, "Skipped: {}", reason),
            JobError::Timeout(after) => write!(f, "Job timed out after {:?}", after),
        }
    }
}

impl std::error::Error for JobError {}

/// Trait for background jobs.
///
/// Jobs are executed synchronously in a blocking context.
/// Long-running work should check `ctx.is_cancelled()` and return early
/// with `JobError::Cancelled`.
pub trait BackgroundJob: Send + Sync {
    /// Unique name, used as the registry key.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schedule(&self) -> JobSchedule;

    /// Jobs sharing a class never run concurrently. Defaults to the job's own name.
    fn exclusivity_class(&self) -> &str {
        self.name()
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    /// Execute the job. Called from `spawn_blocking`.
    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Immutable descriptor of a registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    pub description: String,
    pub schedule: JobSchedule,
    pub exclusivity_class: String,
    pub enabled: bool,
    pub shutdown_behavior: ShutdownBehavior,
}

impl JobDefinition {
    pub fn from_job(job: &dyn BackgroundJob) -> Self {
        Self {
            name: job.name().to_string(),
            description: job.description().to_string(),
            schedule: job.schedule(),
            exclusivity_class: job.exclusivity_class().to_string(),
            enabled: true,
            shutdown_behavior: job.shutdown_behavior(),
        }
    }
}
