use library_orchestrator::background_jobs::{
    BackgroundJob, JobRegistry, JobRunner, Orchestrator, OrchestratorSettings,
};
use library_orchestrator::execution_log::{ExecutionLog, JobRun, SqliteExecutionLog};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// An orchestrator over a fresh `jobs.db` in a temporary directory.
pub struct TestOrchestrator {
    pub orchestrator: Orchestrator,
    // Kept alive for the lifetime of the database file.
    _temp_dir: TempDir,
}

impl TestOrchestrator {
    pub fn new(jobs: Vec<Arc<dyn BackgroundJob>>) -> Self {
        Self::with_settings(jobs, OrchestratorSettings::default())
    }

    pub fn with_settings(jobs: Vec<Arc<dyn BackgroundJob>>, settings: OrchestratorSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let execution_log = Arc::new(
            SqliteExecutionLog::new(temp_dir.path().join("jobs.db"))
                .expect("Failed to open execution log"),
        );

        let mut registry = JobRegistry::new();
        for job in jobs {
            registry.register_job(job).expect("Failed to register job");
        }

        Self {
            orchestrator: Orchestrator::new(registry, execution_log, settings),
            _temp_dir: temp_dir,
        }
    }

    /// A runner sharing the orchestrator's registry and log, for driving
    /// dispatches by hand.
    pub fn runner(&self) -> JobRunner {
        JobRunner::new(
            Arc::clone(self.orchestrator.registry()),
            Arc::clone(self.orchestrator.execution_log()),
            CancellationToken::new(),
        )
    }

    pub fn log(&self) -> &Arc<dyn ExecutionLog> {
        self.orchestrator.execution_log()
    }
}

/// Poll the log until `count` finished runs exist, newest first.
pub async fn wait_for_runs(log: &Arc<dyn ExecutionLog>, count: usize) -> Vec<JobRun> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let runs = log.recent(count + 10).expect("Failed to read execution log");
        let finished = runs.iter().filter(|r| r.status.is_terminal()).count();
        if finished >= count {
            return runs;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {} runs, have {:?}", count, runs);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
