use super::error::OrchestratorError;
use super::handle::{EnqueueAck, JobsHandle};
use super::job::JobParams;
use super::observer::SchedulerObserver;
use super::queue::{JobQueue, Trigger};
use super::registry::JobRegistry;
use super::retry_policy::RetryPolicy;
use super::runner::JobRunner;
use super::scheduler::Scheduler;
use crate::execution_log::ExecutionLog;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tick_interval: Duration,
    /// Number of jobs that may execute at the same time, across all classes.
    pub worker_count: usize,
    /// How long shutdown waits for each in-flight job.
    pub shutdown_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            worker_count: 1,
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Owns the registry, queue, scheduler and worker pool.
///
/// Built once in `main` and shared by reference; there is no global instance.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    execution_log: Arc<dyn ExecutionLog>,
    runner: Arc<JobRunner>,
    scheduler: Arc<Scheduler>,
    handle: JobsHandle,
    settings: OrchestratorSettings,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<OrchestratorError>>>,
}

impl Orchestrator {
    pub fn new(
        registry: JobRegistry,
        execution_log: Arc<dyn ExecutionLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        let registry = Arc::new(registry);
        let queue = Arc::new(JobQueue::new());
        let shutdown_token = CancellationToken::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&execution_log),
            shutdown_token.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&execution_log),
            settings.retry_policy.clone(),
            fatal_tx.clone(),
        ));
        let handle = JobsHandle::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&execution_log),
            Arc::clone(&scheduler),
        );

        Self {
            registry,
            queue,
            execution_log,
            runner,
            scheduler,
            handle,
            settings,
            shutdown_token,
            workers: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn execution_log(&self) -> &Arc<dyn ExecutionLog> {
        &self.execution_log
    }

    pub fn handle(&self) -> JobsHandle {
        self.handle.clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn SchedulerObserver>) {
        self.scheduler.add_observer(observer);
    }

    /// Receiver for infrastructure failures the process should not survive.
    /// Can be taken once.
    pub fn take_fatal_errors(&self) -> Option<mpsc::UnboundedReceiver<OrchestratorError>> {
        self.fatal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Recover stale runs, spawn the worker pool and start the scheduler.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            let stale = self.execution_log.mark_interrupted_runs()?;
            if stale > 0 {
                info!("Marked {} stale runs as failed from previous run", stale);
            }

            let worker_count = self.settings.worker_count.max(1);
            info!(
                "Starting {} worker(s) for {} registered jobs",
                worker_count,
                self.registry.len()
            );
            for id in 0..worker_count {
                workers.push(tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.runner),
                    self.shutdown_token.clone(),
                    self.fatal_tx.clone(),
                )));
            }
        }
        drop(workers);

        self.scheduler.start(self.settings.tick_interval);
        Ok(())
    }

    /// Request a run of `job_name`. Returns as soon as the request is queued.
    pub fn enqueue(
        &self,
        job_name: &str,
        params: JobParams,
        trigger: Trigger,
    ) -> Result<EnqueueAck, OrchestratorError> {
        self.handle.enqueue(job_name, params, trigger)
    }

    /// Stop the scheduler and the workers.
    ///
    /// Cancellable jobs see their token cancelled; every in-flight job gets up
    /// to `shutdown_timeout` to finish before its worker is aborted.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator...");
        self.scheduler.stop().await;
        self.shutdown_token.cancel();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (id, mut handle) in workers.into_iter().enumerate() {
            match tokio::time::timeout(self.settings.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Worker {} ended abnormally: {}", id, e),
                Err(_) => {
                    warn!(
                        "Worker {} did not finish within {:?}, aborting",
                        id, self.settings.shutdown_timeout
                    );
                    handle.abort();
                }
            }
        }

        let pending = self.queue.len();
        if pending > 0 {
            info!("{} pending request(s) dropped at shutdown", pending);
        }
        info!("Orchestrator shutdown complete");
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<JobQueue>,
    runner: Arc<JobRunner>,
    shutdown: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
) {
    debug!("Worker {} started", id);
    while let Some(dispatch) = queue.next_dispatch(&shutdown).await {
        match runner.run(dispatch).await {
            Ok(run) => debug!(
                "Worker {} recorded run {} of {} as {}",
                id,
                run.id,
                run.job_name,
                run.status.as_str()
            ),
            Err(OrchestratorError::UnknownJob(name)) => {
                warn!("Worker {} dropped request for unknown job {}", id, name)
            }
            Err(e) => {
                error!("Worker {} hit a fatal error: {}", id, e);
                let _ = fatal_tx.send(e);
            }
        }
    }
    debug!("Worker {} stopped", id);
}
