use super::context::JobContext;
use super::error::OrchestratorError;
use super::job::{JobError, ShutdownBehavior};
use super::queue::Dispatch;
use super::registry::JobRegistry;
use crate::execution_log::{ExecutionLog, JobRun, RunStart, RunStatus};
use crate::server::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Finalizes a `running` record on every exit path.
///
/// If dropped before `finish` (for instance when the owning future is aborted),
/// the run is recorded as failed.
struct RunRecorder {
    execution_log: Arc<dyn ExecutionLog>,
    run_id: i64,
    job_name: String,
    finished: bool,
}

impl RunRecorder {
    fn begin(
        execution_log: Arc<dyn ExecutionLog>,
        start: &RunStart,
    ) -> anyhow::Result<(Self, JobRun)> {
        let run = execution_log.begin_run(start)?;
        let recorder = Self {
            execution_log,
            run_id: run.id,
            job_name: start.job_name.clone(),
            finished: false,
        };
        Ok((recorder, run))
    }

    fn finish(mut self, status: RunStatus, error_message: Option<&str>) -> anyhow::Result<JobRun> {
        self.finished = true;
        self.execution_log
            .finish_run(self.run_id, status, error_message)
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            "Run {} of {} ended without a result, recording it as failed",
            self.run_id, self.job_name
        );
        if let Err(e) = self.execution_log.finish_run(
            self.run_id,
            RunStatus::Failed,
            Some("Run was interrupted before completion"),
        ) {
            error!("Failed to finalize run {}: {}", self.run_id, e);
        }
    }
}

/// Executes dispatched requests and records exactly one `JobRun` for each.
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    execution_log: Arc<dyn ExecutionLog>,
    shutdown_token: CancellationToken,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        execution_log: Arc<dyn ExecutionLog>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            execution_log,
            shutdown_token,
        }
    }

    /// Run a dispatched request.
    ///
    /// Job failures are recorded and returned inside the `JobRun`; only
    /// lookup and persistence failures are returned as errors. The
    /// exclusivity class is released after the run has been recorded.
    pub async fn run(&self, dispatch: Dispatch) -> Result<JobRun, OrchestratorError> {
        let Dispatch { request, lease } = dispatch;
        let entry = self.registry.lookup(&request.job_name)?.clone();
        let job_name = entry.definition.name.clone();
        let request_id = request.id.to_string();
        let triggered_by = request.trigger.as_str().to_string();

        if self.shutdown_token.is_cancelled() {
            info!("Skipping {} (request {}): shutting down", job_name, request_id);
            let now = Utc::now();
            let mut run = JobRun {
                id: 0,
                job_name: job_name.clone(),
                request_id: Some(request_id),
                started_at: now,
                finished_at: Some(now),
                status: RunStatus::Skipped,
                error_message: Some("Orchestrator is shutting down".to_string()),
                triggered_by,
                params: request.params,
            };
            run.id = self.execution_log.append(&run)?;
            metrics::record_job_run(&job_name, "skipped", Duration::ZERO);
            drop(lease);
            return Ok(run);
        }

        let start = RunStart {
            job_name: job_name.clone(),
            request_id: Some(request_id.clone()),
            triggered_by: triggered_by.clone(),
            params: request.params.clone(),
        };
        let (recorder, run) = RunRecorder::begin(Arc::clone(&self.execution_log), &start)?;

        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            job_name, run.id, triggered_by
        );
        metrics::set_job_running(&job_name, true);

        let cancellation_token = match entry.definition.shutdown_behavior {
            ShutdownBehavior::Cancellable => self.shutdown_token.child_token(),
            ShutdownBehavior::WaitForCompletion => CancellationToken::new(),
        };
        let ctx = JobContext::new(
            cancellation_token,
            Arc::clone(&self.execution_log),
            job_name.clone(),
            request_id,
            request.params,
        );

        let job = Arc::clone(&entry.job);
        let start_time = Instant::now();
        let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;
        let elapsed = start_time.elapsed();

        let (status, error_msg, status_label) = match result {
            Ok(Ok(())) => {
                info!("Job {} completed successfully in {:?}", job_name, elapsed);
                (RunStatus::Succeeded, None, "success")
            }
            Ok(Err(JobError::Skipped(reason))) => {
                info!("Job {} skipped: {}", job_name, reason);
                (RunStatus::Skipped, Some(reason), "skipped")
            }
            Ok(Err(JobError::Cancelled)) => {
                info!("Job {} was cancelled after {:?}", job_name, elapsed);
                (RunStatus::Failed, Some("Cancelled".to_string()), "cancelled")
            }
            Ok(Err(e)) => {
                error!("Job {} failed after {:?}: {}", job_name, elapsed, e);
                (RunStatus::Failed, Some(e.to_string()), "failed")
            }
            Err(e) => {
                error!("Job {} panicked after {:?}: {}", job_name, elapsed, e);
                (RunStatus::Failed, Some(format!("Task panic: {}", e)), "panic")
            }
        };

        metrics::record_job_run(&job_name, status_label, elapsed);
        metrics::set_job_running(&job_name, false);

        let finished = recorder.finish(status, error_msg.as_deref())?;
        drop(lease);
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::queue::{JobQueue, JobRequest, Trigger};
    use crate::background_jobs::testing::FnJob;
    use crate::background_jobs::{BackgroundJob, JobParams};
    use crate::execution_log::SqliteExecutionLog;

    struct Fixture {
        queue: Arc<JobQueue>,
        log: Arc<SqliteExecutionLog>,
        shutdown: CancellationToken,
        runner: JobRunner,
    }

    fn fixture(jobs: Vec<FnJob>) -> Fixture {
        let mut registry = JobRegistry::new();
        for job in jobs {
            registry.register_job(Arc::new(job)).unwrap();
        }
        let log = Arc::new(SqliteExecutionLog::in_memory().unwrap());
        let shutdown = CancellationToken::new();
        let runner = JobRunner::new(Arc::new(registry), log.clone(), shutdown.clone());
        Fixture {
            queue: Arc::new(JobQueue::new()),
            log,
            shutdown,
            runner,
        }
    }

    fn dispatch(queue: &Arc<JobQueue>, job_name: &str, params: JobParams) -> Dispatch {
        queue.enqueue(JobRequest::new(job_name, job_name, params, Trigger::Manual));
        queue.dequeue_next().unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_is_recorded() {
        let f = fixture(vec![FnJob::ok("rss-sync")]);

        let run = f
            .runner
            .run(dispatch(&f.queue, "rss-sync", JobParams::new()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.triggered_by, "manual");
        assert!(run.finished_at.is_some());
        assert_eq!(f.log.recent(10).unwrap().len(), 1);
        assert!(!f.queue.is_running("rss-sync"));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_returned() {
        let f = fixture(vec![FnJob::new("episode-search", |_| {
            Err(JobError::ExecutionFailed("no indexers available".to_string()))
        })]);

        let run = f
            .runner
            .run(dispatch(&f.queue, "episode-search", JobParams::new()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.error_message.as_deref(),
            Some("Execution failed: no indexers available")
        );
        assert_eq!(f.log.history("episode-search", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let f = fixture(vec![FnJob::new("rename", |_| panic!("boom"))]);

        let run = f
            .runner
            .run(dispatch(&f.queue, "rename", JobParams::new()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().starts_with("Task panic:"));
        assert!(!f.queue.is_running("rename"));
    }

    #[tokio::test]
    async fn test_job_can_report_skipped() {
        let f = fixture(vec![FnJob::new("disk-scan", |_| {
            Err(JobError::Skipped("library folder missing".to_string()))
        })]);

        let run = f
            .runner
            .run(dispatch(&f.queue, "disk-scan", JobParams::new()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Skipped);
        assert_eq!(run.error_message.as_deref(), Some("library folder missing"));
    }

    #[tokio::test]
    async fn test_params_reach_job_body() {
        let f = fixture(vec![FnJob::new("episode-search", |ctx| {
            match ctx.param("episode_id") {
                Some("42") => Ok(()),
                other => Err(JobError::ExecutionFailed(format!("got {:?}", other))),
            }
        })]);

        let mut params = JobParams::new();
        params.insert("episode_id".to_string(), "42".to_string());
        let run = f
            .runner
            .run(dispatch(&f.queue, "episode-search", params))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.params.get("episode_id").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_skipped() {
        let f = fixture(vec![FnJob::new("rss-sync", |_| {
            Err(JobError::ExecutionFailed("must not run".to_string()))
        })]);
        let d = dispatch(&f.queue, "rss-sync", JobParams::new());
        f.shutdown.cancel();

        let run = f.runner.run(d).await.unwrap();

        assert_eq!(run.status, RunStatus::Skipped);
        assert!(run.id > 0);
        assert_eq!(f.log.recent(10).unwrap().len(), 1);
        assert!(!f.queue.is_running("rss-sync"));
    }

    #[tokio::test]
    async fn test_unknown_job_fails_fast() {
        let f = fixture(vec![]);
        let d = dispatch(&f.queue, "ghost", JobParams::new());

        let result = f.runner.run(d).await;

        assert!(matches!(result, Err(OrchestratorError::UnknownJob(name)) if name == "ghost"));
        assert!(f.log.recent(10).unwrap().is_empty());
        assert!(!f.queue.is_running("ghost"));
    }

    #[tokio::test]
    async fn test_class_is_held_until_run_is_recorded() {
        let log = Arc::new(SqliteExecutionLog::in_memory().unwrap());
        let queue = Arc::new(JobQueue::new());
        let observed = {
            let queue = Arc::clone(&queue);
            move |_: &JobContext| {
                if queue.is_running("disk-scan") {
                    Ok(())
                } else {
                    Err(JobError::ExecutionFailed("class not held".to_string()))
                }
            }
        };
        let mut registry = JobRegistry::new();
        registry
            .register_job(Arc::new(FnJob::new("disk-scan", observed)))
            .unwrap();
        let runner = JobRunner::new(Arc::new(registry), log.clone(), CancellationToken::new());

        let run = runner
            .run(dispatch(&queue, "disk-scan", JobParams::new()))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(!queue.is_running("disk-scan"));
    }

    #[tokio::test]
    async fn test_cancellable_job_sees_shutdown() {
        let f = fixture(vec![FnJob::new("rss-sync", |ctx| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if ctx.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        })]);
        let d = dispatch(&f.queue, "rss-sync", JobParams::new());

        let shutdown = f.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });
        let run = f.runner.run(d).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn test_fn_job_defaults() {
        let job = FnJob::ok("rss-sync");
        assert_eq!(job.exclusivity_class(), "rss-sync");
    }
}
