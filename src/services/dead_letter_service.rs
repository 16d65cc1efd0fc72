use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::webhook_store::{DeadLetterFilter, WebhookStore};
use crate::error::{Error, Result};
use crate::models::failed_webhook::{FailedWebhook, WebhookStatus};
use crate::models::webhook_stats::WebhookStatistics;
use crate::services::retry_service::{RetryOutcome, WebhookRetryService};
use crate::services::webhook_handler::WebhookHandler;

pub use crate::database::webhook_store::MAX_ATTEMPTS_EXCEEDED;

/// Moves a record to the dead letter queue. Shared by the retry processor and
/// [`DeadLetterService::move_to_dead_letter_queue`].
pub(crate) async fn quarantine(
    store: &dyn WebhookStore,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let moved = store.mark_failed(id, reason.to_string(), now).await?;
    if moved {
        error!(webhook_id = id, reason, "webhook moved to dead letter queue");
    } else {
        warn!(webhook_id = id, reason, "webhook not moved to dead letter queue (missing or succeeded)");
    }
    Ok(moved)
}

#[derive(Clone)]
pub struct DeadLetterService {
    store: Arc<dyn WebhookStore>,
    retry: WebhookRetryService,
}

impl DeadLetterService {
    pub fn new(retry: WebhookRetryService) -> Self {
        Self {
            store: retry.store().clone(),
            retry,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.retry.clock().now()
    }

    pub async fn move_to_dead_letter_queue(&self, id: i64, reason: &str) -> Result<bool> {
        quarantine(self.store.as_ref(), id, reason, self.now()).await
    }

    /// Dead-lettered records, most recently updated first.
    pub async fn get_dead_letter_queue(
        &self,
        limit: i64,
        offset: i64,
        webhook_type: Option<&str>,
    ) -> Result<Vec<FailedWebhook>> {
        self.store
            .list_failed(DeadLetterFilter {
                limit: limit.max(0),
                offset: offset.max(0),
                webhook_type: webhook_type.map(str::to_string),
            })
            .await
    }

    pub async fn get_dead_letter_queue_count(&self, webhook_type: Option<&str>) -> Result<i64> {
        self.store
            .count_failed(webhook_type.map(str::to_string))
            .await
    }

    pub async fn get_dead_letter(&self, id: i64) -> Result<FailedWebhook> {
        match self.store.get(id).await? {
            Some(record) if record.status == WebhookStatus::Failed => Ok(record),
            _ => Err(Error::NotFound(format!(
                "Webhook {} not found in dead letter queue",
                id
            ))),
        }
    }

    /// Resets a dead-lettered record and replays it immediately.
    pub async fn replay_webhook(
        &self,
        id: i64,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<RetryOutcome> {
        let record = self
            .store
            .reset_for_replay(id, self.now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Webhook {} not found in dead letter queue", id)))?;

        info!(
            webhook_id = id,
            webhook_type = %record.webhook_type,
            "replaying webhook from dead letter queue"
        );
        self.retry.process_webhook_retry(&record, handler).await
    }

    pub async fn delete_from_dead_letter_queue(&self, id: i64) -> Result<()> {
        if !self.store.delete_failed(id).await? {
            return Err(Error::NotFound(format!(
                "Webhook {} not found in dead letter queue",
                id
            )));
        }
        info!(webhook_id = id, "deleted webhook from dead letter queue");
        Ok(())
    }

    pub async fn get_webhook_statistics(&self) -> Result<WebhookStatistics> {
        let counts = self.store.status_counts().await?;
        Ok(WebhookStatistics::from_counts(counts))
    }
}
