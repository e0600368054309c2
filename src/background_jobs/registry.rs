use super::error::OrchestratorError;
use super::job::{BackgroundJob, JobDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A job definition paired with the body that executes it.
#[derive(Clone)]
pub struct RegisteredJob {
    pub definition: JobDefinition,
    pub job: Arc<dyn BackgroundJob>,
}

/// The set of known jobs, in registration order.
///
/// Populated at startup and shared read-only afterwards.
#[derive(Default)]
pub struct JobRegistry {
    entries: Vec<RegisteredJob>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field(
                "jobs",
                &self.entries.iter().map(|e| &e.definition.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under an explicit definition.
    pub fn register(
        &mut self,
        definition: JobDefinition,
        job: Arc<dyn BackgroundJob>,
    ) -> Result<(), OrchestratorError> {
        if self.index.contains_key(&definition.name) {
            return Err(OrchestratorError::DuplicateName(definition.name));
        }
        info!(
            "Registering job: {} - {} (class: {}, enabled: {})",
            definition.name,
            definition.description,
            definition.exclusivity_class,
            definition.enabled
        );
        self.index.insert(definition.name.clone(), self.entries.len());
        self.entries.push(RegisteredJob { definition, job });
        Ok(())
    }

    /// Register a job using the definition it describes for itself.
    pub fn register_job(&mut self, job: Arc<dyn BackgroundJob>) -> Result<(), OrchestratorError> {
        let definition = JobDefinition::from_job(job.as_ref());
        self.register(definition, job)
    }

    pub fn lookup(&self, name: &str) -> Result<&RegisteredJob, OrchestratorError> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| OrchestratorError::UnknownJob(name.to_string()))
    }

    /// All definitions in registration order. Each call starts a fresh pass.
    pub fn all(&self) -> impl Iterator<Item = &JobDefinition> + '_ {
        self.entries.iter().map(|entry| &entry.definition)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::{JobContext, JobError, JobSchedule};

    struct NamedJob(&'static str);

    impl BackgroundJob for NamedJob {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test job"
        }

        fn schedule(&self) -> JobSchedule {
            JobSchedule::Manual
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry.register_job(Arc::new(NamedJob("rss-sync"))).unwrap();

        let entry = registry.lookup("rss-sync").unwrap();
        assert_eq!(entry.definition.name, "rss-sync");
        assert_eq!(entry.job.name(), "rss-sync");
        assert!(registry.contains("rss-sync"));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = JobRegistry::new();
        registry.register_job(Arc::new(NamedJob("rename"))).unwrap();

        let result = registry.register_job(Arc::new(NamedJob("rename")));
        assert!(matches!(result, Err(OrchestratorError::DuplicateName(name)) if name == "rename"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_unknown_job() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.lookup("missing"),
            Err(OrchestratorError::UnknownJob(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_all_preserves_registration_order_and_restarts() {
        let mut registry = JobRegistry::new();
        for name in ["rss-sync", "disk-scan", "episode-search"] {
            registry.register_job(Arc::new(NamedJob(name))).unwrap();
        }

        let first: Vec<_> = registry.all().map(|d| d.name.as_str()).collect();
        let second: Vec<_> = registry.all().map(|d| d.name.as_str()).collect();
        assert_eq!(first, vec!["rss-sync", "disk-scan", "episode-search"]);
        assert_eq!(first, second);
    }
}
