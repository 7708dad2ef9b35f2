//! Job handlers and the worker pools that drive them.
//!
//! Each claimed job runs in its own task, so a panic in one handler fails
//! that job only. Every notification is handled under a short id lease owned
//! by one handler invocation, and finalized at most once.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_notifier::{ErrorClass, SendOutcome};

use crate::broker::QueueName;
use crate::context::EngineContext;
use crate::queue::{FailDisposition, Job, JobPayload, QueuedNotification};
use crate::store::TerminalRecord;

/// What a handler did with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered { provider_id: String },
    InvalidToken,
    Failed { attempts: i32 },
    /// Retryable failure handed to the retry queue.
    RetryScheduled { retry_job_id: u64, attempts: i32 },
    /// Retryable failure left `pending` for the scheduler to pick up again.
    AwaitingReschedule { attempts: i32 },
    /// Already finalized or being handled elsewhere.
    Skipped,
    Batch(BatchSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub sent: usize,
    pub invalid_token: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn lease_key(id: Uuid) -> String {
    format!("notification:{}", id)
}

pub struct Dispatcher {
    ctx: Arc<EngineContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run the handler for `job`. Leases taken along the way are held as `owner`.
    pub async fn handle(&self, job: &Job, owner: &str) -> Result<JobOutcome, AppError> {
        match &job.payload {
            JobPayload::Single { notification } => {
                self.handle_single(owner, job.id, notification).await
            }
            JobPayload::Batch { notifications } => self.handle_batch(owner, notifications).await,
            JobPayload::Retry {
                notification,
                original_job_id,
                retry_attempt,
            } => {
                tracing::debug!(
                    notification_id = %notification.id,
                    original_job_id,
                    retry_attempt,
                    "Retrying notification"
                );
                self.handle_retry(owner, notification).await
            }
        }
    }

    async fn acquire(&self, owner: &str, id: Uuid) -> Result<bool, AppError> {
        let ttl = self.ctx.queues.settings().lease;
        self.ctx.queues.broker().try_lease(&lease_key(id), owner, ttl).await
    }

    async fn release(&self, owner: &str, ids: &[Uuid]) {
        for id in ids {
            if let Err(e) = self.ctx.queues.broker().release_lease(&lease_key(*id), owner).await {
                tracing::warn!(notification_id = %id, error = %e, "Failed to release notification lease");
            }
        }
    }

    /// Deliver one notification from the single queue.
    ///
    /// Retryable failures go to the retry queue while the persisted attempt
    /// count allows it; everything else is terminal.
    pub async fn handle_single(
        &self,
        owner: &str,
        job_id: u64,
        item: &QueuedNotification,
    ) -> Result<JobOutcome, AppError> {
        if !self.acquire(owner, item.id).await? {
            tracing::debug!(notification_id = %item.id, "Notification leased elsewhere, skipping");
            return Ok(JobOutcome::Skipped);
        }
        let result = self.deliver_single(job_id, item.id).await;
        self.release(owner, &[item.id]).await;
        result
    }

    async fn deliver_single(&self, job_id: u64, id: Uuid) -> Result<JobOutcome, AppError> {
        let Some(row) = self.ctx.store.mark_processing(&[id]).await?.into_iter().next() else {
            return Ok(JobOutcome::Skipped);
        };

        match self.ctx.gateway.send(&row).await {
            SendOutcome::Delivered { provider_id } => {
                self.ctx
                    .store
                    .finalize(&TerminalRecord::sent(row, &provider_id))
                    .await?;
                Ok(JobOutcome::Delivered { provider_id })
            }
            SendOutcome::Rejected {
                error,
                class: ErrorClass::TokenInvalid,
            } => {
                self.ctx
                    .store
                    .finalize(&TerminalRecord::invalid_token(row, error.to_string()))
                    .await?;
                Ok(JobOutcome::InvalidToken)
            }
            SendOutcome::Rejected {
                error,
                class: ErrorClass::Retryable,
            } if row.attempts < self.max_attempts() => {
                let attempts = row.attempts + 1;
                let retry_delay = self.ctx.queues.settings().retry_delay();
                let fallback_at = Utc::now()
                    + chrono::Duration::from_std(retry_delay * 2).unwrap_or(chrono::Duration::zero());

                self.ctx
                    .store
                    .reschedule(row.id, attempts, &error.to_string(), fallback_at)
                    .await?;

                match self
                    .ctx
                    .queues
                    .enqueue_retry(QueuedNotification::from(&row), job_id, 0)
                    .await
                {
                    Ok(retry_job_id) => {
                        tracing::info!(
                            notification_id = %row.id,
                            attempts,
                            retry_job_id,
                            "Notification scheduled for retry"
                        );
                        Ok(JobOutcome::RetryScheduled {
                            retry_job_id,
                            attempts,
                        })
                    }
                    Err(e) => {
                        // The row is pending with a due time, so the sweep picks it up
                        tracing::warn!(
                            notification_id = %row.id,
                            error = %e,
                            "Retry enqueue failed, leaving notification for the scheduler"
                        );
                        Ok(JobOutcome::AwaitingReschedule { attempts })
                    }
                }
            }
            SendOutcome::Rejected { error, .. } => {
                let record = TerminalRecord::failed(row, error.to_string());
                let attempts = record.attempts;
                self.ctx.store.finalize(&record).await?;
                Ok(JobOutcome::Failed { attempts })
            }
        }
    }

    /// Deliver one notification from the retry queue.
    ///
    /// A retryable failure within the attempt cap returns the row to
    /// `pending`, due now, for the scheduler to re-enqueue.
    pub async fn handle_retry(
        &self,
        owner: &str,
        item: &QueuedNotification,
    ) -> Result<JobOutcome, AppError> {
        if !self.acquire(owner, item.id).await? {
            return Ok(JobOutcome::Skipped);
        }
        let result = self.deliver_retry(item.id).await;
        self.release(owner, &[item.id]).await;
        result
    }

    async fn deliver_retry(&self, id: Uuid) -> Result<JobOutcome, AppError> {
        let Some(row) = self.ctx.store.mark_processing(&[id]).await?.into_iter().next() else {
            return Ok(JobOutcome::Skipped);
        };

        match self.ctx.gateway.send(&row).await {
            SendOutcome::Delivered { provider_id } => {
                self.ctx
                    .store
                    .finalize(&TerminalRecord::sent(row, &provider_id))
                    .await?;
                Ok(JobOutcome::Delivered { provider_id })
            }
            SendOutcome::Rejected {
                error,
                class: ErrorClass::TokenInvalid,
            } => {
                self.ctx
                    .store
                    .finalize(&TerminalRecord::invalid_token(row, error.to_string()))
                    .await?;
                Ok(JobOutcome::InvalidToken)
            }
            SendOutcome::Rejected {
                error,
                class: ErrorClass::Retryable,
            } if row.attempts < self.max_attempts() => {
                let attempts = row.attempts + 1;
                self.ctx
                    .store
                    .reschedule(row.id, attempts, &error.to_string(), Utc::now())
                    .await?;
                tracing::warn!(
                    notification_id = %row.id,
                    attempts,
                    error = %error,
                    "Retry failed, notification returned to pending"
                );
                Ok(JobOutcome::AwaitingReschedule { attempts })
            }
            SendOutcome::Rejected { error, .. } => {
                let record = TerminalRecord::failed(row, error.to_string());
                let attempts = record.attempts;
                self.ctx.store.finalize(&record).await?;
                Ok(JobOutcome::Failed { attempts })
            }
        }
    }

    /// Deliver a batch job.
    ///
    /// If the provider call fails as a whole, every row is marked `failed`
    /// and the error is returned so the batch queue retries the job. Item
    /// failures are terminal, retryable or not.
    pub async fn handle_batch(
        &self,
        owner: &str,
        items: &[QueuedNotification],
    ) -> Result<JobOutcome, AppError> {
        let mut leased = Vec::with_capacity(items.len());
        for item in items {
            match self.acquire(owner, item.id).await {
                Ok(true) => leased.push(item.id),
                Ok(false) => {}
                Err(e) => {
                    self.release(owner, &leased).await;
                    return Err(e);
                }
            }
        }

        let result = self.deliver_batch(&leased).await;
        self.release(owner, &leased).await;

        let mut summary = result?;
        summary.skipped += items.len() - leased.len();
        Ok(JobOutcome::Batch(summary))
    }

    async fn deliver_batch(&self, ids: &[Uuid]) -> Result<BatchSummary, AppError> {
        let rows = self.ctx.store.mark_processing(ids).await?;
        let mut summary = BatchSummary {
            skipped: ids.len() - rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(summary);
        }

        let report = match self.ctx.gateway.send_batch(&rows).await {
            Ok(report) => report,
            Err(e) => {
                let message = e.to_string();
                let row_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
                self.ctx.store.mark_failed(&row_ids, &message).await?;
                tracing::error!(count = rows.len(), error = %message, "Batch send failed");
                return Err(e.into());
            }
        };

        for (row, outcome) in rows.into_iter().zip(report.results) {
            let record = match outcome {
                SendOutcome::Delivered { provider_id } => {
                    summary.sent += 1;
                    TerminalRecord::sent(row, &provider_id)
                }
                SendOutcome::Rejected {
                    error,
                    class: ErrorClass::TokenInvalid,
                } => {
                    summary.invalid_token += 1;
                    TerminalRecord::invalid_token(row, error.to_string())
                }
                SendOutcome::Rejected { error, .. } => {
                    summary.failed += 1;
                    TerminalRecord::failed(row, error.to_string())
                }
            };
            self.ctx.store.finalize(&record).await?;
        }

        Ok(summary)
    }

    fn max_attempts(&self) -> i32 {
        self.ctx.settings.max_retry_attempts as i32
    }

    /// Record notifications from a job that exhausted its attempts as failed.
    async fn give_up(&self, job: &Job, error: &str) {
        let ids = job.payload.notification_ids();
        let rows = match self.ctx.store.mark_processing(&ids).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to load rows of exhausted job");
                return;
            }
        };
        for row in rows {
            let id = row.id;
            if let Err(e) = self
                .ctx
                .store
                .finalize(&TerminalRecord::failed(row, error))
                .await
            {
                tracing::error!(notification_id = %id, error = %e, "Failed to finalize exhausted notification");
            }
        }
    }

    /// Claim and run one job from `queue`. Returns `false` if none was ready.
    pub async fn process_next(self: &Arc<Self>, queue: QueueName) -> Result<bool, AppError> {
        let claim = self.ctx.queues.claim(queue).await?;
        if claim.requeued_stalled > 0 {
            self.ctx.observer.stalled(queue, claim.requeued_stalled);
        }
        let Some(job) = claim.job else {
            return Ok(false);
        };
        self.process(job).await;
        Ok(true)
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let started = Instant::now();
        let owner = Uuid::new_v4().to_string();
        let dispatcher = Arc::clone(self);
        let task_job = job.clone();
        let task_owner = owner.clone();
        let result =
            tokio::spawn(async move { dispatcher.handle(&task_job, &task_owner).await }).await;

        let error = match result {
            Ok(Ok(outcome)) => {
                if let Err(e) = self.ctx.queues.complete(&job).await {
                    tracing::error!(queue = %job.queue, job_id = job.id, error = %e, "Failed to acknowledge job");
                }
                self.ctx
                    .observer
                    .completed(&job, &outcome, started.elapsed());
                return;
            }
            Ok(Err(e)) if e.is_infrastructure() => {
                self.ctx
                    .observer
                    .failed(&job, &e.to_string(), FailDisposition::Unacknowledged);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => {
                // The aborted handler never reached its own release
                self.release(&owner, &job.payload.notification_ids()).await;
                format!("job handler panicked: {}", join_error)
            }
        };

        match self.ctx.queues.fail(&job, &error).await {
            Ok(disposition) => {
                self.ctx.observer.failed(&job, &error, disposition);
                if disposition == FailDisposition::Exhausted {
                    self.give_up(&job, &error).await;
                }
            }
            Err(e) => {
                tracing::error!(queue = %job.queue, job_id = job.id, error = %e, "Failed to record job failure");
            }
        }
    }

    /// Spawn the worker pools, sized by each queue's concurrency.
    pub fn spawn_pools(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            let concurrency = self.ctx.queues.settings().policy(queue).concurrency;
            for worker in 0..concurrency {
                handles.push(tokio::spawn(Arc::clone(self).worker_loop(
                    queue,
                    worker,
                    shutdown.clone(),
                )));
            }
            tracing::info!(queue = %queue, concurrency, "Worker pool started");
        }
        handles
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: QueueName,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let poll = self.ctx.settings.worker_poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next(queue).await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!(queue = %queue, worker, error = %e, "Failed to claim job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(queue = %queue, worker, "Worker stopped");
    }
}
