//! Background job orchestrator library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod background_jobs;
pub mod config;
pub mod execution_log;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_jobs::{BackgroundJob, JobContext, JobRegistry, Orchestrator};
pub use execution_log::{ExecutionLog, SqliteExecutionLog};
pub use server::{run_server, RequestsLoggingLevel};
