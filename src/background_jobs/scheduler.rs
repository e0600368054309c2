use super::error::OrchestratorError;
use super::job::{JobDefinition, JobParams};
use super::observer::SchedulerObserver;
use super::queue::{JobQueue, JobRequest, Trigger};
use super::registry::JobRegistry;
use super::retry_policy::RetryPolicy;
use crate::execution_log::{ExecutionLog, JobRun, RunStatus};
use crate::server::metrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Extra history rows fetched beyond `max_retries`, so that a few skipped runs
/// do not hide earlier failures.
const HISTORY_SLACK: usize = 8;

/// When a job becomes due next, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextDue {
    /// `None` means immediately.
    pub at: Option<DateTime<Utc>>,
    pub trigger: Trigger,
}

impl NextDue {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.at.map_or(true, |at| at <= now)
    }
}

fn after(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Compute when an interval job is due, given its latest successful run and
/// its recent runs, newest first.
///
/// A job that never succeeded is due now. Otherwise it is due one interval
/// after the start of its latest success. After consecutive failures, and
/// while the retry policy allows it, it is due again after a backoff measured
/// from the end of the latest failure, if that comes sooner.
pub fn next_due(
    interval: Duration,
    last_success: Option<&JobRun>,
    recent: &[JobRun],
    policy: &RetryPolicy,
) -> NextDue {
    let Some(success) = last_success else {
        return NextDue {
            at: None,
            trigger: Trigger::Schedule,
        };
    };
    let regular = after(success.started_at, interval);

    let mut finished = recent
        .iter()
        .filter(|run| run.status.is_terminal())
        .take_while(|run| run.started_at > success.started_at)
        .peekable();
    let Some(latest) = finished.peek().copied() else {
        return NextDue {
            at: Some(regular),
            trigger: Trigger::Schedule,
        };
    };
    if latest.status == RunStatus::Failed {
        let failures = finished
            .take_while(|run| run.status == RunStatus::Failed)
            .count() as u32;
        if policy.should_retry(failures) {
            let failed_at = latest.finished_at.unwrap_or(latest.started_at);
            let retry_at = after(failed_at, policy.backoff(failures - 1));
            if retry_at < regular {
                return NextDue {
                    at: Some(retry_at),
                    trigger: Trigger::Retry,
                };
            }
        }
    }

    NextDue {
        at: Some(regular),
        trigger: Trigger::Schedule,
    }
}

enum SchedulerState {
    Stopped,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
        interval: Duration,
    },
}

/// Periodic timer that enqueues due jobs. It never executes jobs itself.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    execution_log: Arc<dyn ExecutionLog>,
    retry_policy: RetryPolicy,
    observers: RwLock<Vec<Arc<dyn SchedulerObserver>>>,
    state: Mutex<SchedulerState>,
    fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        execution_log: Arc<dyn ExecutionLog>,
        retry_policy: RetryPolicy,
        fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
    ) -> Self {
        Self {
            registry,
            queue,
            execution_log,
            retry_policy,
            observers: RwLock::new(Vec::new()),
            state: Mutex::new(SchedulerState::Stopped),
            fatal_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> Vec<Arc<dyn SchedulerObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn SchedulerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), SchedulerState::Running { .. })
    }

    /// The interval of the running timer, if any.
    pub fn tick_interval(&self) -> Option<Duration> {
        match *self.state() {
            SchedulerState::Running { interval, .. } => Some(interval),
            SchedulerState::Stopped => None,
        }
    }

    /// Start ticking every `interval`, the first tick firing immediately.
    /// Returns `false` if the scheduler was already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut state = self.state();
        if let SchedulerState::Running { .. } = *state {
            debug!("Scheduler already running, ignoring start");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).tick_loop(interval, cancel.clone()));
        *state = SchedulerState::Running {
            cancel,
            handle,
            interval,
        };
        drop(state);

        for observer in self.observers() {
            observer.on_started(interval);
        }
        true
    }

    /// Stop ticking. Jobs already enqueued or running are left alone.
    /// Returns `false` if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state(), SchedulerState::Stopped);
        let SchedulerState::Running { cancel, handle, .. } = previous else {
            return false;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            error!("Scheduler task ended abnormally: {}", e);
        }

        for observer in self.observers() {
            observer.on_stopped();
        }
        true
    }

    async fn tick_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        error!("Scheduler tick failed: {:#}", e);
                        let _ = self.fatal_tx.send(OrchestratorError::Persistence(e));
                    }
                }
            }
        }
        debug!("Scheduler tick loop exited");
    }

    /// Run one scheduling pass at the current time.
    pub fn tick(&self) -> Result<Vec<String>> {
        self.tick_at(Utc::now())
    }

    /// Enqueue every enabled interval job that is due at `now` and not already
    /// pending or running. Returns the names of the enqueued jobs.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut enqueued = Vec::new();

        for definition in self.registry.all() {
            if let Some(trigger) = self.due_trigger(definition, now)? {
                let request = JobRequest::new(
                    definition.name.clone(),
                    definition.exclusivity_class.clone(),
                    JobParams::new(),
                    trigger,
                );
                if self.queue.enqueue_if_idle(request) {
                    info!(
                        "Enqueued {} (triggered_by: {})",
                        definition.name,
                        trigger.as_str()
                    );
                    metrics::record_job_enqueued(&definition.name, trigger.as_str(), "accepted");
                    enqueued.push(definition.name.clone());
                }
            }
        }

        metrics::record_scheduler_tick();
        for observer in self.observers() {
            observer.on_tick(now, &enqueued);
        }
        Ok(enqueued)
    }

    fn due_trigger(&self, definition: &JobDefinition, now: DateTime<Utc>) -> Result<Option<Trigger>> {
        if !definition.enabled {
            return Ok(None);
        }
        let Some(interval) = definition.schedule.interval() else {
            return Ok(None);
        };
        if self.queue.is_pending(&definition.name) || self.queue.is_running(&definition.name) {
            return Ok(None);
        }

        let due = self.compute_next_due(&definition.name, interval)?;
        Ok(due.is_due(now).then_some(due.trigger))
    }

    /// When the given job is next due, or `None` for jobs the scheduler never
    /// enqueues (manual or disabled).
    pub fn next_due_for(&self, definition: &JobDefinition) -> Result<Option<NextDue>> {
        if !definition.enabled {
            return Ok(None);
        }
        let Some(interval) = definition.schedule.interval() else {
            return Ok(None);
        };
        self.compute_next_due(&definition.name, interval).map(Some)
    }

    fn compute_next_due(&self, job_name: &str, interval: Duration) -> Result<NextDue> {
        let last_success = self.execution_log.last_successful(job_name)?;
        let window = self.retry_policy.max_retries as usize + 1 + HISTORY_SLACK;
        let recent = self.execution_log.history(job_name, window)?;
        Ok(next_due(
            interval,
            last_success.as_ref(),
            &recent,
            &self.retry_policy,
        ))
    }
}
