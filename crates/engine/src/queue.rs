//! Queue manager: the three delivery queues, their retry policies, and the
//! payloads that travel through them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::config::AppConfig;
use beacon_common::error::AppError;
use beacon_common::types::{PendingNotification, Priority};

use crate::broker::{FinishedState, JobBroker, QueueCounts, QueueName};

/// Most notifications carried by one batch job.
pub const MAX_BATCH_JOB_SIZE: usize = 500;

/// Finished jobs are kept this long before `clean` drops them.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Delay before a failed attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(attempts_made - 1)`
    Exponential { base: Duration },
    Fixed { delay: Duration },
}

impl Backoff {
    /// Delay after the `attempts_made`-th failed attempt (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base } => {
                let exponent = attempts_made.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exponent)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub single: QueuePolicy,
    pub batch: QueuePolicy,
    pub retry: QueuePolicy,
    /// Lease on a claimed job; an unacknowledged job is redelivered after it.
    pub lease: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            single: QueuePolicy {
                concurrency: 5,
                max_attempts: config.max_retry_attempts,
                backoff: Backoff::Exponential {
                    base: Duration::from_millis(config.retry_delay_ms),
                },
            },
            batch: QueuePolicy {
                concurrency: 2,
                max_attempts: 2,
                backoff: Backoff::Exponential {
                    base: Duration::from_millis(config.batch_retry_delay_ms),
                },
            },
            retry: QueuePolicy {
                concurrency: 3,
                max_attempts: 1,
                backoff: Backoff::Fixed {
                    delay: Duration::from_millis(config.retry_queue_delay_ms),
                },
            },
            lease: Duration::from_secs(config.job_lease_secs),
        }
    }

    pub fn policy(&self, queue: QueueName) -> &QueuePolicy {
        match queue {
            QueueName::Single => &self.single,
            QueueName::Batch => &self.batch,
            QueueName::Retry => &self.retry,
        }
    }

    /// Delay before a notification handed to the retry queue is attempted.
    pub fn retry_delay(&self) -> Duration {
        self.retry.backoff.delay_for(1)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            single: QueuePolicy {
                concurrency: 5,
                max_attempts: 3,
                backoff: Backoff::Exponential {
                    base: Duration::from_millis(5000),
                },
            },
            batch: QueuePolicy {
                concurrency: 2,
                max_attempts: 2,
                backoff: Backoff::Exponential {
                    base: Duration::from_millis(10_000),
                },
            },
            retry: QueuePolicy {
                concurrency: 3,
                max_attempts: 1,
                backoff: Backoff::Fixed {
                    delay: Duration::from_millis(30_000),
                },
            },
            lease: Duration::from_secs(300),
        }
    }
}

/// Reference to a stored notification. Handlers reload the row, so the
/// pending table stays the single source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub device_token: String,
    pub priority: Priority,
}

impl From<&PendingNotification> for QueuedNotification {
    fn from(row: &PendingNotification) -> Self {
        Self {
            id: row.id,
            device_token: row.device_token.clone(),
            priority: row.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Single {
        notification: QueuedNotification,
    },
    Batch {
        notifications: Vec<QueuedNotification>,
    },
    Retry {
        notification: QueuedNotification,
        original_job_id: u64,
        retry_attempt: u32,
    },
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Single { .. } => QueueName::Single,
            JobPayload::Batch { .. } => QueueName::Batch,
            JobPayload::Retry { .. } => QueueName::Retry,
        }
    }

    pub fn notification_ids(&self) -> Vec<Uuid> {
        match self {
            JobPayload::Single { notification } | JobPayload::Retry { notification, .. } => {
                vec![notification.id]
            }
            JobPayload::Batch { notifications } => notifications.iter().map(|n| n.id).collect(),
        }
    }
}

/// A claimed job with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub attempts_made: u32,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claim {
    pub job: Option<Job>,
    pub requeued_stalled: u64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Redelivered after the delay.
    Rescheduled(Duration),
    /// Attempts used up; the job is in the failed set.
    Exhausted,
    /// Not acknowledged; the lease will expire and the job is redelivered.
    Unacknowledged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub single: QueueCounts,
    pub batch: QueueCounts,
    pub retry: QueueCounts,
}

/// Wait before a notification scheduled at `scheduled_at` becomes due.
pub fn delay_until(scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (scheduled_at - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Clone)]
pub struct QueueManager {
    broker: Arc<dyn JobBroker>,
    settings: QueueSettings,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn JobBroker>, settings: QueueSettings) -> Self {
        Self { broker, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    async fn push(
        &self,
        payload: &JobPayload,
        priority: u32,
        delay: Duration,
    ) -> Result<u64, AppError> {
        let queue = payload.queue();
        let data = serde_json::to_string(payload)?;
        let job_id = self.broker.enqueue(queue, &data, priority, delay).await?;

        tracing::debug!(
            queue = %queue,
            job_id,
            priority,
            delay_ms = delay.as_millis() as u64,
            "Job enqueued"
        );

        Ok(job_id)
    }

    /// Enqueue one notification on the single queue, weighted by its priority.
    pub async fn enqueue_single(
        &self,
        notification: QueuedNotification,
        delay: Duration,
    ) -> Result<u64, AppError> {
        let priority = notification.priority.weight();
        self.push(&JobPayload::Single { notification }, priority, delay)
            .await
    }

    /// Enqueue notifications on the batch queue, one job per 500.
    pub async fn enqueue_batch(
        &self,
        notifications: Vec<QueuedNotification>,
    ) -> Result<Vec<u64>, AppError> {
        let mut job_ids = Vec::new();

        for chunk in notifications.chunks(MAX_BATCH_JOB_SIZE) {
            let priority = chunk
                .iter()
                .map(|n| n.priority.weight())
                .max()
                .unwrap_or_else(|| Priority::Normal.weight());
            let payload = JobPayload::Batch {
                notifications: chunk.to_vec(),
            };
            job_ids.push(self.push(&payload, priority, Duration::ZERO).await?);
        }

        Ok(job_ids)
    }

    /// Hand a notification to the retry queue after the fixed retry delay.
    pub async fn enqueue_retry(
        &self,
        notification: QueuedNotification,
        original_job_id: u64,
        previous_retry_attempt: u32,
    ) -> Result<u64, AppError> {
        let priority = notification.priority.weight();
        let payload = JobPayload::Retry {
            notification,
            original_job_id,
            retry_attempt: previous_retry_attempt + 1,
        };
        self.push(&payload, priority, self.settings.retry_delay())
            .await
    }

    /// Lease the next job from `queue`.
    ///
    /// A job whose payload cannot be decoded is moved straight to the failed
    /// set and reported as no job.
    pub async fn claim(&self, queue: QueueName) -> Result<Claim, AppError> {
        let raw = self.broker.claim(queue, self.settings.lease).await?;
        let Some(job) = raw.job else {
            return Ok(Claim {
                job: None,
                requeued_stalled: raw.requeued_stalled,
            });
        };

        match serde_json::from_str::<JobPayload>(&job.data) {
            Ok(payload) => Ok(Claim {
                job: Some(Job {
                    id: job.id,
                    queue,
                    payload,
                    attempts_made: job.attempts_made,
                }),
                requeued_stalled: raw.requeued_stalled,
            }),
            Err(e) => {
                tracing::error!(queue = %queue, job_id = job.id, error = %e, "Undecodable job payload");
                self.broker
                    .fail(queue, job.id, &format!("undecodable payload: {}", e), None)
                    .await?;
                Ok(Claim {
                    job: None,
                    requeued_stalled: raw.requeued_stalled,
                })
            }
        }
    }

    pub async fn complete(&self, job: &Job) -> Result<(), AppError> {
        if !self.broker.complete(job.queue, job.id).await? {
            tracing::warn!(queue = %job.queue, job_id = job.id, "Completed job had lost its lease");
        }
        Ok(())
    }

    /// Record a failed attempt and apply the queue's retry policy.
    pub async fn fail(&self, job: &Job, reason: &str) -> Result<FailDisposition, AppError> {
        let disposition = self.disposition_after_failure(job);
        let retry_after = match disposition {
            FailDisposition::Rescheduled(delay) => Some(delay),
            _ => None,
        };
        self.broker
            .fail(job.queue, job.id, reason, retry_after)
            .await?;
        Ok(disposition)
    }

    fn disposition_after_failure(&self, job: &Job) -> FailDisposition {
        let policy = self.settings.policy(job.queue);
        let attempts_made = job.attempts_made + 1;
        if attempts_made < policy.max_attempts {
            FailDisposition::Rescheduled(policy.backoff.delay_for(attempts_made))
        } else {
            FailDisposition::Exhausted
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, AppError> {
        Ok(QueueStats {
            single: self.broker.counts(QueueName::Single).await?,
            batch: self.broker.counts(QueueName::Batch).await?,
            retry: self.broker.counts(QueueName::Retry).await?,
        })
    }

    /// Pause every queue. Each queue is attempted; the first error is returned.
    pub async fn pause_all(&self) -> Result<(), AppError> {
        let mut first_error = None;
        for queue in QueueName::ALL {
            if let Err(e) = self.broker.pause(queue).await {
                tracing::error!(queue = %queue, error = %e, "Failed to pause queue");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("All queues paused");
                Ok(())
            }
        }
    }

    pub async fn resume_all(&self) -> Result<(), AppError> {
        let mut first_error = None;
        for queue in QueueName::ALL {
            if let Err(e) = self.broker.resume(queue).await {
                tracing::error!(queue = %queue, error = %e, "Failed to resume queue");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("All queues resumed");
                Ok(())
            }
        }
    }

    /// Drop completed jobs older than `completed_ttl` and failed jobs older
    /// than `failed_ttl` from every queue.
    ///
    /// Housekeeping passes [`COMPLETED_RETENTION`] and [`FAILED_RETENTION`].
    pub async fn clean(&self, completed_ttl: Duration, failed_ttl: Duration) -> Result<u64, AppError> {
        let mut removed = 0;
        for queue in QueueName::ALL {
            removed += self
                .broker
                .clean(queue, FinishedState::Completed, completed_ttl)
                .await?;
            removed += self
                .broker
                .clean(queue, FinishedState::Failed, failed_ttl)
                .await?;
        }
        tracing::info!(
            removed,
            completed_ttl_secs = completed_ttl.as_secs(),
            failed_ttl_secs = failed_ttl.as_secs(),
            "Queues cleaned"
        );
        Ok(removed)
    }
}
