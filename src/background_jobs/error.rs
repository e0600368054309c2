use thiserror::Error;

/// Errors raised by the orchestrator itself, as opposed to job bodies.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job already registered: {0}")]
    DuplicateName(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}
