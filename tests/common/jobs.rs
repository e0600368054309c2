use library_orchestrator::background_jobs::{BackgroundJob, JobContext, JobError, JobSchedule};
use std::time::Duration;

type Body = Box<dyn Fn(&JobContext) -> Result<(), JobError> + Send + Sync>;

pub struct TestJob {
    name: String,
    class: String,
    schedule: JobSchedule,
    body: Body,
}

impl TestJob {
    pub fn new(
        name: &str,
        body: impl Fn(&JobContext) -> Result<(), JobError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            class: name.to_string(),
            schedule: JobSchedule::Manual,
            body: Box::new(body),
        }
    }

    pub fn ok(name: &str) -> Self {
        Self::new(name, |_| Ok(()))
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.schedule = JobSchedule::Interval(interval);
        self
    }

    pub fn in_class(mut self, class: &str) -> Self {
        self.class = class.to_string();
        self
    }
}

impl BackgroundJob for TestJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test job"
    }

    fn schedule(&self) -> JobSchedule {
        self.schedule
    }

    fn exclusivity_class(&self) -> &str {
        &self.class
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.body)(ctx)
    }
}
