//! Job lifecycle hooks.

use std::time::Duration;

use crate::broker::QueueName;
use crate::dispatcher::JobOutcome;
use crate::queue::{FailDisposition, Job};

/// Receives job lifecycle events from the worker pools.
pub trait JobObserver: Send + Sync {
    fn completed(&self, job: &Job, outcome: &JobOutcome, elapsed: Duration);

    fn failed(&self, job: &Job, error: &str, disposition: FailDisposition);

    /// Expired leases found and returned to the waiting set.
    fn stalled(&self, queue: QueueName, count: u64);
}

/// Logs lifecycle events with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn completed(&self, job: &Job, outcome: &JobOutcome, elapsed: Duration) {
        tracing::info!(
            queue = %job.queue,
            job_id = job.id,
            outcome = ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
    }

    fn failed(&self, job: &Job, error: &str, disposition: FailDisposition) {
        match disposition {
            FailDisposition::Rescheduled(delay) => tracing::warn!(
                queue = %job.queue,
                job_id = job.id,
                attempts_made = job.attempts_made + 1,
                retry_in_ms = delay.as_millis() as u64,
                error,
                "Job failed, will retry"
            ),
            FailDisposition::Exhausted => tracing::error!(
                queue = %job.queue,
                job_id = job.id,
                attempts_made = job.attempts_made + 1,
                error,
                "Job failed permanently"
            ),
            FailDisposition::Unacknowledged => tracing::warn!(
                queue = %job.queue,
                job_id = job.id,
                error,
                "Job left unacknowledged after infrastructure error"
            ),
        }
    }

    fn stalled(&self, queue: QueueName, count: u64) {
        tracing::warn!(queue = %queue, count, "Stalled jobs returned to queue");
    }
}
