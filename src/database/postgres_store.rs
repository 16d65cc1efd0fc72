use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::webhook_store::{
    AttemptFailure, DeadLetterFilter, WebhookStore, ERROR_SEPARATOR, MAX_ATTEMPTS_EXCEEDED,
};
use crate::error::Result;
use crate::models::failed_webhook::{
    FailedWebhook, NewFailedWebhook, WebhookStatus, PAYLOAD_SCHEMA_VERSION,
};
use crate::models::webhook_stats::StatusCount;

const COLUMNS: &str = "id, webhook_type, webhook_url, payload, headers, schema_version, \
    attempt_count, max_attempts, next_retry_at, error_message, error_stack, status, \
    created_at, updated_at";

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn insert(&self, record: NewFailedWebhook, now: DateTime<Utc>) -> Result<FailedWebhook> {
        let sql = format!(
            r#"
            INSERT INTO failed_webhooks (
                webhook_type, webhook_url, payload, headers, schema_version,
                attempt_count, max_attempts, next_retry_at, error_message, error_stack,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9, 'pending', $10, $10)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(record.webhook_type)
            .bind(record.webhook_url)
            .bind(record.payload)
            .bind(record.headers)
            .bind(PAYLOAD_SCHEMA_VERSION)
            .bind(record.max_attempts)
            .bind(record.next_retry_at)
            .bind(record.error_message)
            .bind(record.error_stack)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<FailedWebhook>> {
        let sql = format!("SELECT {COLUMNS} FROM failed_webhooks WHERE id = $1");
        let row = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM failed_webhooks
            WHERE status = 'pending' AND next_retry_at <= $1 AND attempt_count < max_attempts
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>> {
        let sql = format!(
            r#"
            UPDATE failed_webhooks SET status = 'processing', updated_at = $1
            WHERE id IN (
                SELECT id FROM failed_webhooks
                WHERE status = 'pending' AND next_retry_at <= $1 AND attempt_count < max_attempts
                ORDER BY next_retry_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );
        let mut rows = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        // RETURNING does not preserve the subquery order.
        rows.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>> {
        let sql = format!(
            r#"
            UPDATE failed_webhooks SET status = 'processing', updated_at = $2
            WHERE id = $1 AND status = 'pending' AND attempt_count < max_attempts
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE failed_webhooks
            SET status = CASE WHEN attempt_count >= max_attempts THEN 'failed' ELSE 'pending' END,
                error_message = CASE
                    WHEN attempt_count < max_attempts THEN error_message
                    WHEN error_message = '' THEN $3
                    ELSE error_message || $4 || $3
                END,
                updated_at = $2
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(MAX_ATTEMPTS_EXCEEDED)
        .bind(ERROR_SEPARATOR)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_status(
        &self,
        id: i64,
        status: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_webhooks SET status = $2, updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_succeeded(&self, id: i64, attempt_count: i32, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_webhooks SET status = 'succeeded', attempt_count = $2, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        id: i64,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_webhooks
            SET attempt_count = $2,
                error_message = $3,
                error_stack = $4,
                next_retry_at = COALESCE($5, next_retry_at),
                status = CASE WHEN $5::timestamptz IS NULL THEN status ELSE 'pending' END,
                updated_at = $6
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(failure.attempt_count)
        .bind(failure.error_message)
        .bind(failure.error_stack)
        .bind(failure.next_retry_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: i64, reason: String, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_webhooks
            SET status = 'failed',
                error_message = CASE WHEN error_message = '' THEN $2
                                     ELSE error_message || $3 || $2 END,
                updated_at = $4
            WHERE id = $1 AND status <> 'succeeded'
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(ERROR_SEPARATOR)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_for_replay(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>> {
        let sql = format!(
            r#"
            UPDATE failed_webhooks
            SET status = 'pending', attempt_count = 0, next_retry_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_failed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM failed_webhooks WHERE id = $1 AND status = 'failed'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_failed(&self, filter: DeadLetterFilter) -> Result<Vec<FailedWebhook>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM failed_webhooks
            WHERE status = 'failed' AND ($1::text IS NULL OR webhook_type = $1)
            ORDER BY updated_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query_as::<_, FailedWebhook>(&sql)
            .bind(filter.webhook_type)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count_failed(&self, webhook_type: Option<String>) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM failed_webhooks
            WHERE status = 'failed' AND ($1::text IS NULL OR webhook_type = $1)
            "#,
        )
        .bind(webhook_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query(
            r#"
            SELECT webhook_type, status, COUNT(*) AS count
            FROM failed_webhooks
            GROUP BY webhook_type, status
            ORDER BY webhook_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let status = status
                    .parse::<WebhookStatus>()
                    .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
                Ok(StatusCount {
                    webhook_type: row.try_get("webhook_type")?,
                    status,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }
}
