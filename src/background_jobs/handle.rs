use super::error::OrchestratorError;
use super::job::{JobDefinition, JobParams, JobSchedule};
use super::queue::{EnqueueOutcome, JobQueue, JobRequest, Trigger};
use super::registry::JobRegistry;
use super::scheduler::Scheduler;
use crate::execution_log::{ExecutionLog, JobRun};
use crate::server::metrics;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Information about a registered job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub exclusivity_class: String,
    pub enabled: bool,
    pub is_running: bool,
    pub is_pending: bool,
    pub last_run: Option<JobRunInfo>,
    pub last_success: Option<JobRunInfo>,
    pub next_run_at: Option<String>,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_secs: Option<u64>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                value_secs: Some(duration.as_secs()),
            },
            JobSchedule::Manual => JobScheduleInfo {
                schedule_type: "manual".to_string(),
                value_secs: None,
            },
        }
    }
}

/// Serializable job run information.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunInfo {
    pub id: i64,
    pub job_name: String,
    pub request_id: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub params: JobParams,
}

impl From<JobRun> for JobRunInfo {
    fn from(run: JobRun) -> Self {
        JobRunInfo {
            id: run.id,
            duration_ms: run.duration().map(|d| d.num_milliseconds()),
            job_name: run.job_name,
            request_id: run.request_id,
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|dt| dt.to_rfc3339()),
            status: run.status.as_str().to_string(),
            error_message: run.error_message,
            triggered_by: run.triggered_by,
            params: run.params,
        }
    }
}

/// A request waiting in the queue.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequestInfo {
    pub request_id: String,
    pub job_name: String,
    pub exclusivity_class: String,
    pub enqueued_at: String,
    pub triggered_by: String,
    pub params: JobParams,
}

impl From<JobRequest> for PendingRequestInfo {
    fn from(request: JobRequest) -> Self {
        PendingRequestInfo {
            request_id: request.id.to_string(),
            job_name: request.job_name,
            exclusivity_class: request.exclusivity_class,
            enqueued_at: request.enqueued_at.to_rfc3339(),
            triggered_by: request.trigger.as_str().to_string(),
            params: request.params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub scheduler_running: bool,
    pub tick_interval_secs: Option<u64>,
    pub running_jobs: Vec<String>,
    pub pending: Vec<PendingRequestInfo>,
}

/// Immediate answer to an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueAck {
    pub request_id: Uuid,
    pub outcome: EnqueueOutcome,
}

/// Handle to query and trigger jobs from HTTP handlers.
#[derive(Clone)]
pub struct JobsHandle {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    execution_log: Arc<dyn ExecutionLog>,
    scheduler: Arc<Scheduler>,
}

impl JobsHandle {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        execution_log: Arc<dyn ExecutionLog>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            registry,
            queue,
            execution_log,
            scheduler,
        }
    }

    /// Put a request for `job_name` on the queue without waiting for it to run.
    pub fn enqueue(
        &self,
        job_name: &str,
        params: JobParams,
        trigger: Trigger,
    ) -> Result<EnqueueAck, OrchestratorError> {
        let entry = self.registry.lookup(job_name)?;
        let request = JobRequest::new(
            entry.definition.name.clone(),
            entry.definition.exclusivity_class.clone(),
            params,
            trigger,
        );
        let request_id = request.id;
        let outcome = self.queue.enqueue(request);

        info!(
            "Request {} for {} {} (triggered_by: {})",
            request_id,
            job_name,
            outcome.as_str(),
            trigger.as_str()
        );
        metrics::record_job_enqueued(job_name, trigger.as_str(), outcome.as_str());
        Ok(EnqueueAck {
            request_id,
            outcome,
        })
    }

    fn job_info(&self, definition: &JobDefinition) -> Result<JobInfo> {
        let last_run = self
            .execution_log
            .last_run(&definition.name)?
            .map(JobRunInfo::from);
        let last_success = self
            .execution_log
            .last_successful(&definition.name)?
            .map(JobRunInfo::from);
        let next_run_at = self
            .scheduler
            .next_due_for(definition)?
            .map(|due| due.at.unwrap_or_else(Utc::now).to_rfc3339());

        Ok(JobInfo {
            name: definition.name.clone(),
            description: definition.description.clone(),
            schedule: definition.schedule.into(),
            exclusivity_class: definition.exclusivity_class.clone(),
            enabled: definition.enabled,
            is_running: self.queue.is_running(&definition.name),
            is_pending: self.queue.is_pending(&definition.name),
            last_run,
            last_success,
            next_run_at,
        })
    }

    /// All registered jobs, in registration order.
    pub fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        self.registry
            .all()
            .map(|definition| self.job_info(definition))
            .collect()
    }

    pub fn get_job(&self, job_name: &str) -> Result<JobInfo, OrchestratorError> {
        let entry = self.registry.lookup(job_name)?;
        Ok(self.job_info(&entry.definition)?)
    }

    pub fn get_job_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> Result<Vec<JobRunInfo>, OrchestratorError> {
        self.registry.lookup(job_name)?;
        let history = self.execution_log.history(job_name, limit)?;
        Ok(history.into_iter().map(JobRunInfo::from).collect())
    }

    /// Most recent runs across all jobs, newest first.
    pub fn get_recent_history(&self, limit: usize) -> Result<Vec<JobRunInfo>> {
        let runs = self.execution_log.recent(limit)?;
        Ok(runs.into_iter().map(JobRunInfo::from).collect())
    }

    pub fn queue_info(&self) -> QueueInfo {
        QueueInfo {
            scheduler_running: self.scheduler.is_running(),
            tick_interval_secs: self.scheduler.tick_interval().map(|d| d.as_secs()),
            running_jobs: self.queue.running_jobs(),
            pending: self
                .queue
                .pending()
                .into_iter()
                .map(PendingRequestInfo::from)
                .collect(),
        }
    }
}
