//! Deduplicating queue of pending job requests.
//!
//! A request is pending from `enqueue` until a worker takes it with
//! `dequeue_next`. Taking a request also claims its exclusivity class; the
//! claim is held by the returned [`ClassLease`] and released when the lease is
//! dropped, which wakes any worker waiting for an eligible request.

use super::job::JobParams;
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Who asked for a job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Retry,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Retry => "retry",
            Trigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: Uuid,
    pub job_name: String,
    pub exclusivity_class: String,
    pub params: JobParams,
    pub enqueued_at: DateTime<Utc>,
    pub trigger: Trigger,
}

impl JobRequest {
    pub fn new(
        job_name: impl Into<String>,
        exclusivity_class: impl Into<String>,
        params: JobParams,
        trigger: Trigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            exclusivity_class: exclusivity_class.into(),
            params,
            enqueued_at: Utc::now(),
            trigger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No request for this job was pending.
    Accepted,
    /// A pending request for the same job was replaced.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueOutcome::Accepted => "accepted",
            EnqueueOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobRequest>,
    /// exclusivity class -> name of the job holding it
    running: HashMap<String, String>,
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

/// A dequeued request together with the claim on its exclusivity class.
pub struct Dispatch {
    pub request: JobRequest,
    pub lease: ClassLease,
}

/// Holds an exclusivity class while alive.
pub struct ClassLease {
    queue: Arc<JobQueue>,
    class: String,
}

impl ClassLease {
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Drop for ClassLease {
    fn drop(&mut self) {
        self.queue.lock().running.remove(&self.class);
        debug!("Released exclusivity class {}", self.class);
        self.queue.wake.notify_waiters();
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a request. A pending request for the same job is replaced in place,
    /// so the newer request keeps the older one's position in line.
    pub fn enqueue(&self, request: JobRequest) -> EnqueueOutcome {
        let outcome = {
            let mut state = self.lock();
            let outcome = match state
                .pending
                .iter_mut()
                .find(|pending| pending.job_name == request.job_name)
            {
                Some(existing) => {
                    debug!(
                        "Replacing pending request {} for {} with {}",
                        existing.id, request.job_name, request.id
                    );
                    *existing = request;
                    EnqueueOutcome::Duplicate
                }
                None => {
                    debug!("Enqueued request {} for {}", request.id, request.job_name);
                    state.pending.push_back(request);
                    EnqueueOutcome::Accepted
                }
            };
            metrics::set_queue_pending(state.pending.len());
            outcome
        };
        self.wake.notify_waiters();
        outcome
    }

    /// Add a request unless the job is already pending or running.
    /// Returns whether the request was added.
    pub fn enqueue_if_idle(&self, request: JobRequest) -> bool {
        {
            let mut state = self.lock();
            let busy = state.pending.iter().any(|p| p.job_name == request.job_name)
                || state.running.values().any(|name| *name == request.job_name);
            if busy {
                return false;
            }
            debug!("Enqueued request {} for {}", request.id, request.job_name);
            state.pending.push_back(request);
            metrics::set_queue_pending(state.pending.len());
        }
        self.wake.notify_waiters();
        true
    }

    /// Take the oldest pending request whose exclusivity class is free.
    /// Never blocks.
    pub fn dequeue_next(self: &Arc<Self>) -> Option<Dispatch> {
        let mut state = self.lock();
        let position = state
            .pending
            .iter()
            .position(|request| !state.running.contains_key(&request.exclusivity_class))?;
        let request = state.pending.remove(position)?;
        state
            .running
            .insert(request.exclusivity_class.clone(), request.job_name.clone());
        metrics::set_queue_pending(state.pending.len());

        Some(Dispatch {
            lease: ClassLease {
                queue: Arc::clone(self),
                class: request.exclusivity_class.clone(),
            },
            request,
        })
    }

    /// Wait until a request can be dispatched. Returns `None` once `shutdown`
    /// is cancelled.
    pub async fn next_dispatch(self: &Arc<Self>, shutdown: &CancellationToken) -> Option<Dispatch> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before checking, so a wake between the check and the
            // await is not lost.
            notified.as_mut().enable();

            if let Some(dispatch) = self.dequeue_next() {
                return Some(dispatch);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    pub fn pending(&self) -> Vec<JobRequest> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn is_pending(&self, job_name: &str) -> bool {
        self.lock().pending.iter().any(|p| p.job_name == job_name)
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.lock().running.values().any(|name| name == job_name)
    }

    /// Names of jobs currently holding an exclusivity class.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().running.values().cloned().collect();
        names.sort();
        names
    }
}
