//! PostgreSQL notification store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{
    DeliveryOutcome, HistoryRecord, NewNotification, PendingNotification, PendingStatus,
};

use crate::store::{HistoryFilter, HistoryStats, NotificationStore, TerminalRecord, sort_for_dispatch};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_row(
    conn: &mut PgConnection,
    new: &NewNotification,
    status: PendingStatus,
    now: DateTime<Utc>,
) -> Result<PendingNotification, AppError> {
    let additional_data = new
        .additional_data
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));

    let row: PendingNotification = sqlx::query_as(
        r#"
        INSERT INTO pending_notifications
            (id, device_token, title, body, additional_data, notification_type, priority,
             scheduled_at, status, attempts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&new.device_token)
    .bind(&new.title)
    .bind(&new.body)
    .bind(&additional_data)
    .bind(new.notification_type.to_string())
    .bind(new.priority.to_string())
    .bind(new.scheduled_at.unwrap_or(now))
    .bind(status.to_string())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_pending(
        &self,
        new: &NewNotification,
        status: PendingStatus,
        now: DateTime<Utc>,
    ) -> Result<PendingNotification, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut conn, new, status, now).await
    }

    async fn insert_pending_many(
        &self,
        items: &[(NewNotification, PendingStatus)],
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingNotification>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut rows = Vec::with_capacity(items.len());
        for (new, status) in items {
            rows.push(insert_row(&mut tx, new, *status, now).await?);
        }
        tx.commit().await?;
        Ok(rows)
    }

    async fn mark_processing(&self, ids: &[Uuid]) -> Result<Vec<PendingNotification>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<PendingNotification> = sqlx::query_as(
            r#"
            UPDATE pending_notifications
            SET status = 'processing', updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING *
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        // Keep the caller's order so batch outcomes line up with the job payload
        let position: HashMap<Uuid, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut rows = rows;
        rows.sort_by_key(|row| position.get(&row.id).copied().unwrap_or(usize::MAX));

        Ok(rows)
    }

    async fn mark_failed(&self, ids: &[Uuid], error: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_notifications
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE pending_notifications
            SET status = 'pending',
                attempts = GREATEST(attempts, $2),
                last_error = $3,
                scheduled_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(last_error)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, ids: &[Uuid], scheduled_at: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_notifications
            SET status = 'pending', scheduled_at = $2, updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn finalize(&self, record: &TerminalRecord) -> Result<bool, AppError> {
        let n = &record.notification;
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM pending_notifications WHERE id = $1")
            .bind(n.id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::debug!(notification_id = %n.id, "Notification already finalized");
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO notification_history
                (id, original_id, device_token, title, body, additional_data, notification_type,
                 priority, outcome, attempts, provider_response, last_error, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(n.id)
        .bind(&n.device_token)
        .bind(&n.title)
        .bind(&n.body)
        .bind(&n.additional_data)
        .bind(n.notification_type.to_string())
        .bind(n.priority.to_string())
        .bind(record.outcome.to_string())
        .bind(record.attempts)
        .bind(&record.provider_response)
        .bind(&record.last_error)
        .execute(&mut *tx)
        .await?;

        if let Some(reason) = &record.invalid_token_reason {
            sqlx::query(
                r#"
                INSERT INTO invalid_tokens (device_token, reason, marked_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (device_token) DO NOTHING
                "#,
            )
            .bind(&n.device_token)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingNotification>, AppError> {
        let mut rows: Vec<PendingNotification> = sqlx::query_as(
            r#"
            UPDATE pending_notifications p
            SET status = 'processing', updated_at = NOW()
            FROM (
                SELECT id FROM pending_notifications
                WHERE status = 'pending' AND scheduled_at <= $1
                ORDER BY (priority = 'high') DESC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE p.id = due.id
            RETURNING p.*
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        sort_for_dispatch(&mut rows);
        Ok(rows)
    }

    async fn list_pending(&self) -> Result<Vec<PendingNotification>, AppError> {
        let rows: Vec<PendingNotification> = sqlx::query_as(
            "SELECT * FROM pending_notifications WHERE status = 'pending' ORDER BY scheduled_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_notifications WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, AppError> {
        let rows: Vec<HistoryRecord> = sqlx::query_as(
            r#"
            SELECT * FROM notification_history
            WHERE ($1::text IS NULL OR device_token = $1)
              AND ($2::text IS NULL OR outcome = $2)
              AND ($3::timestamptz IS NULL OR sent_at >= $3)
              AND ($4::timestamptz IS NULL OR sent_at <= $4)
            ORDER BY sent_at DESC
            LIMIT $5
            "#,
        )
        .bind(&filter.device_token)
        .bind(filter.outcome.map(|o| o.to_string()))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn history_stats(&self, since: DateTime<Utc>) -> Result<HistoryStats, AppError> {
        let (total, sent, failed, invalid_token): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE outcome = $2),
                COUNT(*) FILTER (WHERE outcome = $3),
                COUNT(*) FILTER (WHERE outcome = $4)
            FROM notification_history
            WHERE sent_at >= $1
            "#,
        )
        .bind(since)
        .bind(DeliveryOutcome::Sent.to_string())
        .bind(DeliveryOutcome::Failed.to_string())
        .bind(DeliveryOutcome::InvalidToken.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(HistoryStats {
            total,
            sent,
            failed,
            invalid_token,
        })
    }

    async fn invalid_tokens_among(&self, tokens: &[String]) -> Result<Vec<String>, AppError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let invalid: Vec<String> = sqlx::query_scalar(
            "SELECT device_token FROM invalid_tokens WHERE device_token = ANY($1)",
        )
        .bind(tokens)
        .fetch_all(&self.pool)
        .await?;

        Ok(invalid)
    }

    async fn purge_history(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM notification_history WHERE sent_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_invalid_tokens(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM invalid_tokens WHERE marked_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn release_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_notifications
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
