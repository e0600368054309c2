use axum::extract::FromRef;

use crate::background_jobs::JobsHandle;
use std::time::Instant;

use super::ServerConfig;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub jobs: JobsHandle,
}

impl ServerState {
    pub fn new(config: ServerConfig, jobs: JobsHandle) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            jobs,
        }
    }
}

impl FromRef<ServerState> for JobsHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.jobs.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
