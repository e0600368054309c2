use super::job::JobParams;
use crate::execution_log::ExecutionLog;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Cancelled at shutdown for jobs declared `Cancellable`.
    pub cancellation_token: CancellationToken,

    /// Job run history, e.g. for maintenance jobs.
    pub execution_log: Arc<dyn ExecutionLog>,

    /// Name of the job being executed.
    pub job_name: String,

    /// Id of the request that led to this run.
    pub request_id: String,

    /// Parameters carried by the request.
    pub params: JobParams,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        execution_log: Arc<dyn ExecutionLog>,
        job_name: impl Into<String>,
        request_id: impl Into<String>,
        params: JobParams,
    ) -> Self {
        Self {
            cancellation_token,
            execution_log,
            job_name: job_name.into(),
            request_id: request_id.into(),
            params,
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}
