//! Background job orchestration.
//!
//! Jobs are registered once in a [`JobRegistry`]. The [`Scheduler`] ticks at a
//! fixed interval and enqueues interval jobs that are due; external callers
//! enqueue jobs directly. Workers take requests from the [`JobQueue`] one
//! exclusivity class at a time and hand them to the [`JobRunner`], which
//! records every execution in the execution log.

mod context;
mod error;
mod handle;
mod job;
pub mod jobs;
mod observer;
mod orchestrator;
mod queue;
mod registry;
mod retry_policy;
mod runner;
mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use context::JobContext;
pub use error::OrchestratorError;
pub use handle::{
    EnqueueAck, JobInfo, JobRunInfo, JobScheduleInfo, JobsHandle, PendingRequestInfo, QueueInfo,
};
pub use job::{BackgroundJob, JobDefinition, JobError, JobParams, JobSchedule, ShutdownBehavior};
pub use observer::{LoggingObserver, SchedulerObserver};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use queue::{ClassLease, Dispatch, EnqueueOutcome, JobQueue, JobRequest, Trigger};
pub use registry::{JobRegistry, RegisteredJob};
pub use retry_policy::RetryPolicy;
pub use runner::JobRunner;
pub use scheduler::{next_due, NextDue, Scheduler};
