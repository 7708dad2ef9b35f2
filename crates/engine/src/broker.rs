//! Durable priority job broker seam.
//!
//! The broker owns job durability and the lease that keeps a job with at most
//! one active consumer. Retry policy lives one level up in `QueueManager`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use beacon_common::error::AppError;

/// The three delivery queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Single,
    Batch,
    Retry,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Single, QueueName::Batch, QueueName::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Single => "single",
            QueueName::Batch => "batch",
            QueueName::Retry => "retry",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal job states kept for inspection until cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedState {
    Completed,
    Failed,
}

/// A job leased to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawJob {
    pub id: u64,
    pub data: String,
    /// Failed attempts recorded by the broker before this lease.
    pub attempts_made: u32,
}

/// Result of a claim: the leased job, if any, and how many expired leases
/// were returned to the waiting set on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawClaim {
    pub job: Option<RawJob>,
    pub requeued_stalled: u64,
}

/// Per-queue job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Persist a job. Higher `priority` is served first; a non-zero `delay`
    /// parks it until the delay elapses.
    async fn enqueue(
        &self,
        queue: QueueName,
        data: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<u64, AppError>;

    /// Lease the next ready job for `lease`, unless the queue is paused.
    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<RawClaim, AppError>;

    /// Acknowledge a leased job. Returns `false` if the lease had already been lost.
    async fn complete(&self, queue: QueueName, job_id: u64) -> Result<bool, AppError>;

    /// Record a failed attempt. With `retry_after` the job is parked and
    /// redelivered later; without it the job moves to the failed set.
    async fn fail(
        &self,
        queue: QueueName,
        job_id: u64,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), AppError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, AppError>;

    async fn pause(&self, queue: QueueName) -> Result<(), AppError>;

    async fn resume(&self, queue: QueueName) -> Result<(), AppError>;

    /// Drop finished jobs older than `older_than`. Returns how many were removed.
    async fn clean(
        &self,
        queue: QueueName,
        state: FinishedState,
        older_than: Duration,
    ) -> Result<u64, AppError>;

    /// Take an exclusive, expiring lease on an arbitrary key for `owner`.
    async fn try_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Drop the lease if `owner` still holds it. Returns whether it was dropped.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, AppError>;
}
