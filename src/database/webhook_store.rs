//! Persistence contract for failed-webhook records.
//!
//! Every method takes the current time from the caller instead of reading a
//! clock, so the retry engine decides what "now" is and the Postgres and
//! in-memory stores agree on due-ness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::failed_webhook::{FailedWebhook, NewFailedWebhook, WebhookStatus};
use crate::models::webhook_stats::StatusCount;

/// Separator placed between accumulated failure reasons in `error_message`.
pub const ERROR_SEPARATOR: &str = " | ";

/// Reason recorded when a record runs out of attempts.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// Outcome of a failed attempt, written back onto a claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt_count: i32,
    pub error_message: String,
    pub error_stack: Option<String>,
    /// `Some` puts the record back to `pending`; `None` leaves it claimed for
    /// the dead-letter move that follows.
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub limit: i64,
    pub offset: i64,
    pub webhook_type: Option<String>,
}

pub(crate) fn append_reason(existing: &str, reason: &str) -> String {
    if existing.is_empty() {
        reason.to_string()
    } else {
        format!("{existing}{ERROR_SEPARATOR}{reason}")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert(&self, record: NewFailedWebhook, now: DateTime<Utc>) -> Result<FailedWebhook>;

    async fn get(&self, id: i64) -> Result<Option<FailedWebhook>>;

    /// Due, retryable records, oldest `next_retry_at` first. Read-only.
    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>>;

    /// Same selection as [`WebhookStore::find_due`], atomically moved to
    /// `processing`. A record is returned to at most one concurrent caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>>;

    /// Compare-and-swap a single record from `pending` to `processing`.
    /// Records with no attempts left are never claimed.
    async fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>>;

    /// Returns records stuck in `processing` since before `claimed_before` to
    /// `pending`, or to `failed` when their attempts are already exhausted.
    /// The latter get [`MAX_ATTEMPTS_EXCEEDED`] appended to their error history.
    async fn release_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Overrides the status of a `pending` or `processing` record. Terminal
    /// records are left alone and `false` is returned.
    async fn update_status(&self, id: i64, status: WebhookStatus, now: DateTime<Utc>)
        -> Result<bool>;

    async fn mark_succeeded(&self, id: i64, attempt_count: i32, now: DateTime<Utc>)
        -> Result<bool>;

    async fn record_failure(
        &self,
        id: i64,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves a non-succeeded record to `failed`, appending `reason` to its
    /// error history.
    async fn mark_failed(&self, id: i64, reason: String, now: DateTime<Utc>) -> Result<bool>;

    /// `failed` → `pending` with a fresh attempt budget, due at `now`.
    async fn reset_for_replay(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>>;

    async fn delete_failed(&self, id: i64) -> Result<bool>;

    async fn list_failed(&self, filter: DeadLetterFilter) -> Result<Vec<FailedWebhook>>;

    async fn count_failed(&self, webhook_type: Option<String>) -> Result<i64>;

    async fn status_counts(&self) -> Result<Vec<StatusCount>>;
}
