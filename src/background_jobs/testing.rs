//! Closure-backed jobs for unit tests.

use super::context::JobContext;
use super::job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior};

type Body = Box<dyn Fn(&JobContext) -> Result<(), JobError> + Send + Sync>;

pub struct FnJob {
    name: String,
    class: String,
    schedule: JobSchedule,
    shutdown_behavior: ShutdownBehavior,
    body: Body,
}

impl FnJob {
    pub fn new(
        name: &str,
        body: impl Fn(&JobContext) -> Result<(), JobError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            class: name.to_string(),
            schedule: JobSchedule::Manual,
            shutdown_behavior: ShutdownBehavior::Cancellable,
            body: Box::new(body),
        }
    }

    pub fn ok(name: &str) -> Self {
        Self::new(name, |_| Ok(()))
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = class.to_string();
        self
    }

    pub fn with_schedule(mut self, schedule: JobSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_shutdown_behavior(mut self, behavior: ShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self
    }
}

impl BackgroundJob for FnJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "closure job"
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule
    }

    fn exclusivity_class(&self) -> &str {
        &self.class
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        self.shutdown_behavior
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.body)(ctx)
    }
}
