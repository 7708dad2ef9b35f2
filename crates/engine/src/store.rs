//! Durable notification storage seam.
//!
//! Pending rows are the source of truth for anything not yet delivered;
//! history rows are append-only and written exactly once per notification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{
    DeliveryOutcome, HistoryRecord, NewNotification, PendingNotification, PendingStatus,
};

/// Default and maximum page sizes for history queries.
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 1000;

/// A terminal outcome ready to be written.
///
/// Finalizing deletes the pending row, appends one history row and, for
/// invalid tokens, records the token. All three happen or none do.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalRecord {
    pub notification: PendingNotification,
    pub outcome: DeliveryOutcome,
    pub attempts: i32,
    pub provider_response: Option<serde_json::Value>,
    pub last_error: Option<String>,
    /// Reason to store in `invalid_tokens`, for token-invalid outcomes.
    pub invalid_token_reason: Option<String>,
}

impl TerminalRecord {
    pub fn sent(notification: PendingNotification, provider_id: &str) -> Self {
        let attempts = notification.attempts + 1;
        Self {
            notification,
            outcome: DeliveryOutcome::Sent,
            attempts,
            provider_response: Some(serde_json::json!({ "id": provider_id })),
            last_error: None,
            invalid_token_reason: None,
        }
    }

    pub fn failed(notification: PendingNotification, error: impl Into<String>) -> Self {
        let attempts = notification.attempts + 1;
        Self {
            notification,
            outcome: DeliveryOutcome::Failed,
            attempts,
            provider_response: None,
            last_error: Some(error.into()),
            invalid_token_reason: None,
        }
    }

    pub fn invalid_token(notification: PendingNotification, error: impl Into<String>) -> Self {
        let attempts = notification.attempts + 1;
        let error = error.into();
        Self {
            notification,
            outcome: DeliveryOutcome::InvalidToken,
            attempts,
            provider_response: None,
            last_error: Some(error.clone()),
            invalid_token_reason: Some(error),
        }
    }
}

/// Filter for history queries. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub device_token: Option<String>,
    pub outcome: Option<DeliveryOutcome>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl HistoryFilter {
    /// Page size clamped to `1..=MAX_HISTORY_LIMIT`.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.device_token
            .as_ref()
            .is_none_or(|token| &record.device_token == token)
            && self.outcome.is_none_or(|outcome| record.outcome == outcome)
            && self.from.is_none_or(|from| record.sent_at >= from)
            && self.to.is_none_or(|to| record.sent_at <= to)
    }
}

/// Outcome counts over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub invalid_token: i64,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new pending row with the given initial status.
    async fn insert_pending(
        &self,
        new: &NewNotification,
        status: PendingStatus,
        now: DateTime<Utc>,
    ) -> Result<PendingNotification, AppError>;

    /// Insert several submissions in one transaction: all rows are stored or none.
    async fn insert_pending_many(
        &self,
        items: &[(NewNotification, PendingStatus)],
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingNotification>, AppError>;

    /// Mark existing rows `processing` and return them. Ids without a row
    /// (already finalized) are silently absent from the result.
    async fn mark_processing(&self, ids: &[Uuid]) -> Result<Vec<PendingNotification>, AppError>;

    /// Mark rows `failed` with an error, keeping them for a later retry.
    async fn mark_failed(&self, ids: &[Uuid], error: &str) -> Result<u64, AppError>;

    /// Return a row to `pending` with a new attempt count, error and due time.
    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Return rows to `pending`, due at `scheduled_at`, leaving attempts as is.
    async fn release(&self, ids: &[Uuid], scheduled_at: DateTime<Utc>) -> Result<u64, AppError>;

    /// Write a terminal outcome. Returns `false` if the pending row was
    /// already gone, in which case nothing is written.
    async fn finalize(&self, record: &TerminalRecord) -> Result<bool, AppError>;

    /// Atomically flip up to `limit` due `pending` rows to `processing` and
    /// return them, highest priority first then earliest scheduled.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingNotification>, AppError>;

    /// Rows with status `pending`, earliest scheduled first.
    async fn list_pending(&self) -> Result<Vec<PendingNotification>, AppError>;

    async fn count_pending(&self) -> Result<i64, AppError>;

    /// History rows matching `filter`, newest first.
    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, AppError>;

    async fn history_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats, AppError>;

    /// Which of `tokens` are recorded as invalid.
    async fn invalid_tokens_among(&self, tokens: &[String]) -> Result<Vec<String>, AppError>;

    async fn purge_history(&self, before: DateTime<Utc>) -> Result<u64, AppError>;

    async fn purge_invalid_tokens(&self, before: DateTime<Utc>) -> Result<u64, AppError>;

    /// Return `processing` rows untouched since `before` to `pending`.
    async fn release_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Sort rows the way the scheduler hands them out.
pub fn sort_for_dispatch(rows: &mut [PendingNotification]) {
    rows.sort_by(|a, b| {
        b.priority
            .weight()
            .cmp(&a.priority.weight())
            .then(a.scheduled_at.cmp(&b.scheduled_at))
    });
}
