use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::webhook_store::{
    append_reason, AttemptFailure, DeadLetterFilter, WebhookStore, MAX_ATTEMPTS_EXCEEDED,
};
use crate::error::{Error, Result};
use crate::models::failed_webhook::{
    FailedWebhook, NewFailedWebhook, WebhookStatus, PAYLOAD_SCHEMA_VERSION,
};
use crate::models::webhook_stats::StatusCount;

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    records: BTreeMap<i64, FailedWebhook>,
}

/// In-memory webhook store.
///
/// Intended for tests/dev. `set_unavailable(true)` makes every call fail the
/// way a lost database connection would.
#[derive(Debug, Default)]
pub struct InMemoryWebhookStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .lock()
            .map_err(|_| Error::Internal("webhook store lock poisoned".to_string()))
    }
}

fn is_due(record: &FailedWebhook, now: DateTime<Utc>) -> bool {
    record.status == WebhookStatus::Pending
        && record.next_retry_at <= now
        && record.attempt_count < record.max_attempts
}

fn due_sorted(inner: &Inner, now: DateTime<Utc>, limit: i64) -> Vec<i64> {
    let mut due: Vec<&FailedWebhook> = inner.records.values().filter(|r| is_due(r, now)).collect();
    due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at).then(a.id.cmp(&b.id)));
    due.into_iter()
        .take(usize::try_from(limit).unwrap_or(0))
        .map(|r| r.id)
        .collect()
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn insert(&self, record: NewFailedWebhook, now: DateTime<Utc>) -> Result<FailedWebhook> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let stored = FailedWebhook {
            id: inner.next_id,
            webhook_type: record.webhook_type,
            webhook_url: record.webhook_url,
            payload: record.payload,
            headers: record.headers,
            schema_version: PAYLOAD_SCHEMA_VERSION,
            attempt_count: 0,
            max_attempts: record.max_attempts,
            next_retry_at: record.next_retry_at,
            error_message: record.error_message,
            error_stack: record.error_stack,
            status: WebhookStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Option<FailedWebhook>> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>> {
        let inner = self.lock()?;
        Ok(due_sorted(&inner, now, limit)
            .into_iter()
            .filter_map(|id| inner.records.get(&id).cloned())
            .collect())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FailedWebhook>> {
        let mut inner = self.lock()?;
        let ids = due_sorted(&inner, now, limit);
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.records.get_mut(&id) {
                record.status = WebhookStatus::Processing;
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>> {
        let mut inner = self.lock()?;
        match inner.records.get_mut(&id) {
            Some(record)
                if record.status == WebhookStatus::Pending && !record.attempts_exhausted() =>
            {
                record.status = WebhookStatus::Processing;
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut released = 0;
        for record in inner.records.values_mut() {
            if record.status == WebhookStatus::Processing && record.updated_at < claimed_before {
                if record.attempts_exhausted() {
                    record.status = WebhookStatus::Failed;
                    record.error_message =
                        append_reason(&record.error_message, MAX_ATTEMPTS_EXCEEDED);
                } else {
                    record.status = WebhookStatus::Pending;
                }
                record.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn update_status(
        &self,
        id: i64,
        status: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(match inner.records.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                record.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn mark_succeeded(&self, id: i64, attempt_count: i32, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(match inner.records.get_mut(&id) {
            Some(record) if record.status == WebhookStatus::Processing => {
                record.status = WebhookStatus::Succeeded;
                record.attempt_count = attempt_count;
                record.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn record_failure(
        &self,
        id: i64,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(match inner.records.get_mut(&id) {
            Some(record) if record.status == WebhookStatus::Processing => {
                record.attempt_count = failure.attempt_count;
                record.error_message = failure.error_message;
                record.error_stack = failure.error_stack;
                if let Some(next_retry_at) = failure.next_retry_at {
                    record.next_retry_at = next_retry_at;
                    record.status = WebhookStatus::Pending;
                }
                record.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn mark_failed(&self, id: i64, reason: String, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(match inner.records.get_mut(&id) {
            Some(record) if record.status != WebhookStatus::Succeeded => {
                record.status = WebhookStatus::Failed;
                record.error_message = append_reason(&record.error_message, &reason);
                record.updated_at = now;
                true
            }
            _ => false,
        })
    }

    async fn reset_for_replay(&self, id: i64, now: DateTime<Utc>) -> Result<Option<FailedWebhook>> {
        let mut inner = self.lock()?;
        match inner.records.get_mut(&id) {
            Some(record) if record.status == WebhookStatus::Failed => {
                record.status = WebhookStatus::Pending;
                record.attempt_count = 0;
                record.next_retry_at = now;
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_failed(&self, id: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        let is_failed = inner
            .records
            .get(&id)
            .is_some_and(|r| r.status == WebhookStatus::Failed);
        if is_failed {
            inner.records.remove(&id);
        }
        Ok(is_failed)
    }

    async fn list_failed(&self, filter: DeadLetterFilter) -> Result<Vec<FailedWebhook>> {
        let inner = self.lock()?;
        let mut rows: Vec<FailedWebhook> = inner
            .records
            .values()
            .filter(|r| r.status == WebhookStatus::Failed)
            .filter(|r| filter.webhook_type.as_deref().map_or(true, |t| r.webhook_type == t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .collect())
    }

    async fn count_failed(&self, webhook_type: Option<String>) -> Result<i64> {
        let inner = self.lock()?;
        let count = inner
            .records
            .values()
            .filter(|r| r.status == WebhookStatus::Failed)
            .filter(|r| webhook_type.as_deref().map_or(true, |t| r.webhook_type == t))
            .count();
        Ok(count as i64)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let inner = self.lock()?;
        let mut counts: HashMap<(String, WebhookStatus), i64> = HashMap::new();
        for record in inner.records.values() {
            *counts
                .entry((record.webhook_type.clone(), record.status))
                .or_default() += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((webhook_type, status), count)| StatusCount {
                webhook_type,
                status,
                count,
            })
            .collect();
        rows.sort_by(|a, b| {
            a.webhook_type
                .cmp(&b.webhook_type)
                .then(a.status.as_str().cmp(b.status.as_str()))
        });
        Ok(rows)
    }
}
