//! Periodic sweep that promotes due `pending` rows onto the queues.
//!
//! High-priority rows go to the single queue one by one; the rest are
//! grouped into batch jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{PendingNotification, Priority};

use crate::context::EngineContext;
use crate::queue::QueuedNotification;

/// Rows claimed per sweep.
pub const SWEEP_LIMIT: i64 = 100;

/// Normal-priority rows per batch job created by the sweep.
pub const SWEEP_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub high_priority: usize,
    pub normal_priority: usize,
    pub batch_jobs: usize,
}

pub struct Scheduler {
    ctx: Arc<EngineContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Claim due rows and enqueue them.
    ///
    /// Rows that could not be enqueued are returned to `pending` so the next
    /// sweep sees them again.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let rows = self.ctx.store.claim_due(now, SWEEP_LIMIT).await?;
        if rows.is_empty() {
            return Ok(SweepReport::default());
        }

        let (high, normal): (Vec<PendingNotification>, Vec<PendingNotification>) =
            rows.into_iter().partition(|r| r.priority == Priority::High);

        let mut report = SweepReport {
            processed: high.len() + normal.len(),
            high_priority: high.len(),
            normal_priority: normal.len(),
            batch_jobs: 0,
        };

        for (i, row) in high.iter().enumerate() {
            if let Err(e) = self
                .ctx
                .queues
                .enqueue_single(QueuedNotification::from(row), Duration::ZERO)
                .await
            {
                let unqueued: Vec<Uuid> = high[i..]
                    .iter()
                    .chain(normal.iter())
                    .map(|r| r.id)
                    .collect();
                self.release(&unqueued, now).await;
                return Err(e);
            }
        }

        for (i, chunk) in normal.chunks(SWEEP_BATCH_SIZE).enumerate() {
            let items = chunk.iter().map(QueuedNotification::from).collect();
            if let Err(e) = self.ctx.queues.enqueue_batch(items).await {
                let unqueued: Vec<Uuid> = normal[i * SWEEP_BATCH_SIZE..]
                    .iter()
                    .map(|r| r.id)
                    .collect();
                self.release(&unqueued, now).await;
                return Err(e);
            }
            report.batch_jobs += 1;
        }

        tracing::info!(
            processed = report.processed,
            high_priority = report.high_priority,
            normal_priority = report.normal_priority,
            batch_jobs = report.batch_jobs,
            "Scheduled notifications enqueued"
        );

        Ok(report)
    }

    async fn release(&self, ids: &[Uuid], now: DateTime<Utc>) {
        if let Err(e) = self.ctx.store.release(ids, now).await {
            tracing::error!(count = ids.len(), error = %e, "Failed to release unqueued notifications");
        }
    }

    /// Sweep on every tick of the configured interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.ctx.settings.scheduler_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.ctx.settings.scheduler_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "Scheduled sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
