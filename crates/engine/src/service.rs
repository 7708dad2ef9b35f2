//! Notification service facade used by callers of the engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{HistoryRecord, NewNotification, PendingNotification, PendingStatus};
use beacon_notifier::gateway::TokenValidation;

use crate::context::EngineContext;
use crate::queue::{COMPLETED_RETENTION, FAILED_RETENTION, QueueStats, QueuedNotification};
use crate::scheduler::{Scheduler, SweepReport};
use crate::store::{HistoryFilter, HistoryStats};

pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_BODY_LEN: usize = 500;
pub const MAX_SUBMIT_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitStatus {
    /// On the single queue.
    Queued { job_id: u64 },
    /// Held until the sweep finds it due.
    Scheduled { scheduled_at: chrono::DateTime<Utc> },
    /// Stored, but the queue was unreachable; the next sweep enqueues it.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub id: Uuid,
    #[serde(flatten)]
    pub status: SubmitStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub accepted: Vec<Uuid>,
    pub rejected_tokens: Vec<String>,
    pub job_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub today: HistoryStats,
    pub pending: i64,
    pub queues: QueueStats,
}

/// Check a submission before anything is stored.
pub fn validate(new: &NewNotification) -> Result<(), AppError> {
    if new.device_token.trim().is_empty() {
        return Err(AppError::Validation("device token is required".to_string()));
    }
    if new.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }
    if new.body.trim().is_empty() {
        return Err(AppError::Validation("body is required".to_string()));
    }
    if new.title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "title cannot exceed {} characters",
            MAX_TITLE_LEN
        )));
    }
    if new.body.chars().count() > MAX_BODY_LEN {
        return Err(AppError::Validation(format!(
            "body cannot exceed {} characters",
            MAX_BODY_LEN
        )));
    }
    if new
        .additional_data
        .as_ref()
        .is_some_and(|data| !data.is_object())
    {
        return Err(AppError::Validation(
            "additional data must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

pub struct NotificationService {
    ctx: Arc<EngineContext>,
    scheduler: Scheduler,
}

impl NotificationService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            scheduler: Scheduler::new(ctx.clone()),
            ctx,
        }
    }

    /// Accept one notification.
    ///
    /// Future-dated notifications are only stored; the rest are stored as
    /// `processing` and put on the single queue.
    pub async fn submit(&self, new: NewNotification) -> Result<SubmitReceipt, AppError> {
        validate(&new)?;
        let now = Utc::now();

        if let Some(scheduled_at) = new.scheduled_at.filter(|at| *at > now) {
            let row = self
                .ctx
                .store
                .insert_pending(&new, PendingStatus::Pending, now)
                .await?;
            tracing::info!(notification_id = %row.id, scheduled_at = %scheduled_at, "Notification scheduled");
            return Ok(SubmitReceipt {
                id: row.id,
                status: SubmitStatus::Scheduled { scheduled_at },
            });
        }

        let row = self
            .ctx
            .store
            .insert_pending(&new, PendingStatus::Processing, now)
            .await?;

        match self
            .ctx
            .queues
            .enqueue_single(QueuedNotification::from(&row), Duration::ZERO)
            .await
        {
            Ok(job_id) => {
                tracing::info!(notification_id = %row.id, job_id, priority = %row.priority, "Notification queued");
                Ok(SubmitReceipt {
                    id: row.id,
                    status: SubmitStatus::Queued { job_id },
                })
            }
            Err(e) => {
                tracing::warn!(notification_id = %row.id, error = %e, "Enqueue failed, deferring to scheduler");
                self.ctx.store.release(&[row.id], now).await?;
                Ok(SubmitReceipt {
                    id: row.id,
                    status: SubmitStatus::Deferred,
                })
            }
        }
    }

    /// Accept many notifications at once.
    ///
    /// Notifications addressed to known-invalid tokens are not stored and
    /// their tokens are reported back.
    pub async fn submit_batch(
        &self,
        items: Vec<NewNotification>,
    ) -> Result<BatchReceipt, AppError> {
        if items.is_empty() || items.len() > MAX_SUBMIT_BATCH {
            return Err(AppError::Validation(format!(
                "batch must contain between 1 and {} notifications",
                MAX_SUBMIT_BATCH
            )));
        }
        for (i, item) in items.iter().enumerate() {
            validate(item).map_err(|e| match e {
                AppError::Validation(msg) => AppError::Validation(format!("item {}: {}", i, msg)),
                other => other,
            })?;
        }

        let tokens: Vec<String> = items
            .iter()
            .map(|n| n.device_token.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let invalid: HashSet<String> = self
            .ctx
            .store
            .invalid_tokens_among(&tokens)
            .await?
            .into_iter()
            .collect();

        let now = Utc::now();
        let mut receipt = BatchReceipt::default();
        let mut accepted = Vec::with_capacity(items.len());

        for item in items {
            if invalid.contains(&item.device_token) {
                receipt.rejected_tokens.push(item.device_token);
                continue;
            }
            let status = if item.scheduled_at.is_some_and(|at| at > now) {
                PendingStatus::Pending
            } else {
                PendingStatus::Processing
            };
            accepted.push((item, status));
        }

        let rows = self.ctx.store.insert_pending_many(&accepted, now).await?;
        let mut queued = Vec::new();
        for row in &rows {
            receipt.accepted.push(row.id);
            if row.status == PendingStatus::Processing {
                queued.push(QueuedNotification::from(row));
            }
        }

        if !queued.is_empty() {
            let ids: Vec<Uuid> = queued.iter().map(|n| n.id).collect();
            match self.ctx.queues.enqueue_batch(queued).await {
                Ok(job_ids) => receipt.job_ids = job_ids,
                Err(e) => {
                    tracing::warn!(count = ids.len(), error = %e, "Batch enqueue failed, deferring to scheduler");
                    self.ctx.store.release(&ids, now).await?;
                }
            }
        }

        tracing::info!(
            accepted = receipt.accepted.len(),
            rejected = receipt.rejected_tokens.len(),
            jobs = receipt.job_ids.len(),
            "Notification batch submitted"
        );

        Ok(receipt)
    }

    pub async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, AppError> {
        self.ctx.store.list_history(filter).await
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingNotification>, AppError> {
        self.ctx.store.list_pending().await
    }

    /// Today's outcomes (UTC), the pending backlog and per-queue counts.
    pub async fn stats(&self) -> Result<EngineStats, AppError> {
        let midnight = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        Ok(EngineStats {
            today: self.ctx.store.history_stats(midnight).await?,
            pending: self.ctx.store.count_pending().await?,
            queues: self.ctx.queues.stats().await?,
        })
    }

    pub async fn run_scheduled_sweep_now(&self) -> Result<SweepReport, AppError> {
        self.scheduler.sweep(Utc::now()).await
    }

    pub async fn pause_all(&self) -> Result<(), AppError> {
        self.ctx.queues.pause_all().await
    }

    pub async fn resume_all(&self) -> Result<(), AppError> {
        self.ctx.queues.resume_all().await
    }

    pub async fn clean_queues(&self) -> Result<u64, AppError> {
        self.ctx
            .queues
            .clean(COMPLETED_RETENTION, FAILED_RETENTION)
            .await
    }

    pub async fn validate_token(&self, device_token: &str) -> TokenValidation {
        self.ctx.gateway.validate_token(device_token).await
    }
}
