//! Hourly and daily housekeeping.
//!
//! Hourly: drop old finished jobs and return abandoned `processing` rows to
//! `pending`. Daily: purge history older than 30 days and invalid tokens
//! older than 7 days.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use beacon_common::error::AppError;

use crate::context::EngineContext;
use crate::queue::{COMPLETED_RETENTION, FAILED_RETENTION};

const HOURLY: Duration = Duration::from_secs(60 * 60);
const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

pub const HISTORY_RETENTION_DAYS: i64 = 30;
pub const INVALID_TOKEN_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub history: u64,
    pub invalid_tokens: u64,
}

pub struct Maintenance {
    ctx: Arc<EngineContext>,
}

impl Maintenance {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn clean_queues(&self) -> Result<u64, AppError> {
        self.ctx
            .queues
            .clean(COMPLETED_RETENTION, FAILED_RETENTION)
            .await
    }

    /// Return `processing` rows untouched for longer than the stale threshold.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let threshold = chrono::Duration::from_std(self.ctx.settings.stale_processing_after)
            .map_err(|e| AppError::Config(format!("invalid stale threshold: {}", e)))?;
        let released = self.ctx.store.release_stale(now - threshold).await?;
        if released > 0 {
            tracing::warn!(released, "Stale processing notifications returned to pending");
        }
        Ok(released)
    }

    pub async fn purge(&self, now: DateTime<Utc>) -> Result<PurgeReport, AppError> {
        let history = self
            .ctx
            .store
            .purge_history(now - chrono::Duration::days(HISTORY_RETENTION_DAYS))
            .await?;
        let invalid_tokens = self
            .ctx
            .store
            .purge_invalid_tokens(now - chrono::Duration::days(INVALID_TOKEN_RETENTION_DAYS))
            .await?;

        tracing::info!(history, invalid_tokens, "Old records purged");
        Ok(PurgeReport {
            history,
            invalid_tokens,
        })
    }

    async fn hourly(&self) {
        if let Err(e) = self.clean_queues().await {
            tracing::error!(error = %e, "Queue cleanup failed");
        }
        if let Err(e) = self.recover_stale(Utc::now()).await {
            tracing::error!(error = %e, "Stale notification recovery failed");
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut hourly = tokio::time::interval(HOURLY);
        let mut daily = tokio::time::interval(DAILY);
        hourly.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        daily.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Maintenance started");

        loop {
            tokio::select! {
                _ = hourly.tick() => self.hourly().await,
                _ = daily.tick() => {
                    if let Err(e) = self.purge(Utc::now()).await {
                        tracing::error!(error = %e, "Purge failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Maintenance stopped");
    }
}
