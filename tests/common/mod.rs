//! Common test infrastructure
//!
//! Provides closure-backed jobs and an orchestrator fixture backed by a
//! temporary SQLite execution log.

mod fixtures;
mod jobs;

pub use fixtures::{wait_for_runs, TestOrchestrator};
pub use jobs::TestJob;
