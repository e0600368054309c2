use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Callbacks on scheduler lifecycle events.
///
/// All methods have empty defaults; implement the ones you need. Callbacks run
/// on the scheduler's task and must not block.
pub trait SchedulerObserver: Send + Sync {
    fn on_started(&self, _tick_interval: Duration) {}

    fn on_stopped(&self) {}

    /// Called after every tick with the names of the jobs it enqueued.
    fn on_tick(&self, _at: DateTime<Utc>, _enqueued: &[String]) {}
}

/// Writes scheduler lifecycle events to the log.
pub struct LoggingObserver;

impl SchedulerObserver for LoggingObserver {
    fn on_started(&self, tick_interval: Duration) {
        info!("Scheduler started, ticking every {:?}", tick_interval);
    }

    fn on_stopped(&self) {
        info!("Scheduler stopped");
    }

    fn on_tick(&self, at: DateTime<Utc>, enqueued: &[String]) {
        if enqueued.is_empty() {
            debug!("Tick at {}: nothing due", at.to_rfc3339());
        } else {
            info!("Tick at {}: enqueued {}", at.to_rfc3339(), enqueued.join(", "));
        }
    }
}
