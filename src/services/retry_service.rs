//! Retry scheduler and processor for failed inbound webhooks.
//!
//! Nothing in here schedules itself: an external timer calls
//! [`WebhookRetryService::process_pending_webhooks`] on an interval. Each call
//! atomically claims a batch of due records, replays them through their
//! handlers, and writes back one of three outcomes per record: succeeded,
//! rescheduled with backoff, or dead-lettered.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::database::webhook_store::{AttemptFailure, WebhookStore};
use crate::error::{Error, Result};
use crate::models::failed_webhook::{
    headers_to_json, FailedWebhook, NewFailedWebhook, WebhookStatus,
};
use crate::services::dead_letter_service::{quarantine, MAX_ATTEMPTS_EXCEEDED};
use crate::services::retry_policy::RetryPolicy;
use crate::services::webhook_handler::{HandlerRegistry, WebhookContext, WebhookHandler};
use crate::utils::time::{add_delay, sub_delay, Clock, SystemClock};

/// Message and cause chain of a handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub message: String,
    pub stack: Option<String>,
}

impl FailureDetails {
    pub fn new(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack,
        }
    }
}

impl From<&anyhow::Error> for FailureDetails {
    fn from(err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            message: err.to_string(),
            stack: (!causes.is_empty()).then(|| format!("caused by: {}", causes.join("\ncaused by: "))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Succeeded {
        attempt_count: i32,
    },
    Rescheduled {
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempt_count: i32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

#[derive(Clone)]
pub struct WebhookRetryService {
    store: Arc<dyn WebhookStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl WebhookRetryService {
    pub fn new(store: Arc<dyn WebhookStore>, policy: RetryPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn WebhookStore>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> i32 {
        self.policy.max_attempts
    }

    pub fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        self.policy.calculate_retry_delay(attempt_count)
    }

    /// Records a webhook whose live handling failed.
    ///
    /// Never fails: a storage error is logged and `None` is returned, so the
    /// live request path is not given a second way to break.
    pub async fn store_failed_webhook(
        &self,
        webhook_type: &str,
        webhook_url: &str,
        payload: JsonValue,
        headers: &HashMap<String, String>,
        failure: impl Into<FailureDetails>,
    ) -> Option<FailedWebhook> {
        let failure = failure.into();
        let now = self.clock.now();
        let record = NewFailedWebhook {
            webhook_type: webhook_type.to_string(),
            webhook_url: webhook_url.to_string(),
            payload,
            headers: headers_to_json(headers),
            max_attempts: self.policy.max_attempts,
            next_retry_at: add_delay(now, self.policy.calculate_retry_delay(0)),
            error_message: failure.message,
            error_stack: failure.stack,
        };

        match self.store.insert(record, now).await {
            Ok(stored) => {
                info!(
                    webhook_id = stored.id,
                    webhook_type,
                    next_retry_at = %stored.next_retry_at,
                    "stored failed webhook for retry"
                );
                Some(stored)
            }
            Err(e) => {
                error!(webhook_type, webhook_url, error = %e, "failed to store failed webhook");
                None
            }
        }
    }

    /// Runs `handler` on the live path; on failure the event is stored for
    /// retry. Returns whether the handler succeeded live.
    pub async fn dispatch_or_record(
        &self,
        ctx: WebhookContext,
        handler: Arc<dyn WebhookHandler>,
        webhook_url: &str,
    ) -> bool {
        let webhook_type = ctx.webhook_type.clone();
        let body = ctx.body.clone();
        let headers = ctx.headers.clone();
        match self.invoke(handler, ctx).await {
            Ok(()) => true,
            Err(err) => {
                warn!(webhook_type = %webhook_type, error = %err, "live webhook handler failed");
                self.store_failed_webhook(&webhook_type, webhook_url, body, &headers, &err)
                    .await;
                false
            }
        }
    }

    /// Due, retryable records, oldest first. Storage errors yield an empty list.
    pub async fn get_pending_webhooks(&self, limit: i64) -> Vec<FailedWebhook> {
        match self.store.find_due(self.clock.now(), limit).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to fetch pending webhooks");
                Vec::new()
            }
        }
    }

    /// Operator override for a record still in flight. Returns `false` when
    /// the record does not exist. `succeeded` and `failed` records are a
    /// conflict.
    pub async fn update_webhook_status(&self, id: i64, status: WebhookStatus) -> Result<bool> {
        if self
            .store
            .update_status(id, status, self.clock.now())
            .await?
        {
            info!(webhook_id = id, status = %status, "webhook status updated");
            return Ok(true);
        }
        match self.store.get(id).await? {
            Some(record) => Err(Error::Conflict(format!(
                "Webhook {} is {} and its status can no longer be changed",
                id, record.status
            ))),
            None => Ok(false),
        }
    }

    /// Replays one record through `handler` and records the outcome.
    ///
    /// A `pending` record is claimed first; a `processing` record is assumed
    /// to be claimed by the caller already. Anything else, or a record with
    /// no attempts left, is a conflict.
    pub async fn process_webhook_retry(
        &self,
        record: &FailedWebhook,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<RetryOutcome> {
        if record.attempts_exhausted() {
            return Err(Error::Conflict(format!(
                "Webhook {} has no attempts left ({}/{})",
                record.id, record.attempt_count, record.max_attempts
            )));
        }
        let claimed = match record.status {
            WebhookStatus::Processing => record.clone(),
            WebhookStatus::Pending => self
                .store
                .claim(record.id, self.clock.now())
                .await?
                .ok_or_else(|| {
                    Error::Conflict(format!("Webhook {} is already being processed", record.id))
                })?,
            status => {
                return Err(Error::Conflict(format!(
                    "Webhook {} is {} and cannot be retried",
                    record.id, status
                )))
            }
        };
        self.run_attempt(claimed, handler).await
    }

    /// Batch entry point for the external scheduler.
    ///
    /// Never returns an error; per-record problems are logged and reflected
    /// in the counts.
    pub async fn process_pending_webhooks(&self, handlers: &HandlerRegistry) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let now = self.clock.now();

        match self
            .store
            .release_stale(sub_delay(now, self.policy.processing_lease), now)
            .await
        {
            Ok(0) => {}
            Ok(released) => warn!(released, "released stale webhook claims"),
            Err(e) => error!(error = %e, "failed to release stale webhook claims"),
        }

        let claimed = match self.store.claim_due(now, self.policy.batch_size).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to claim due webhooks");
                return summary;
            }
        };

        for record in claimed {
            summary.processed += 1;
            let id = record.id;

            let Some(handler) = handlers.get(&record.webhook_type) else {
                let reason = format!(
                    "no handler registered for webhook type '{}'",
                    record.webhook_type
                );
                match quarantine(self.store.as_ref(), id, &reason, self.clock.now()).await {
                    Ok(_) => summary.failed += 1,
                    Err(e) => error!(webhook_id = id, error = %e, "failed to dead-letter unroutable webhook"),
                }
                continue;
            };

            match self.run_attempt(record, handler).await {
                Ok(RetryOutcome::Succeeded { .. }) => summary.succeeded += 1,
                Ok(RetryOutcome::Rescheduled { .. }) => summary.rescheduled += 1,
                Ok(RetryOutcome::DeadLettered { .. }) => summary.failed += 1,
                Err(e) => error!(
                    webhook_id = id,
                    error = %e,
                    "failed to record webhook retry outcome; claim will expire"
                ),
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                rescheduled = summary.rescheduled,
                "processed webhook retry batch"
            );
        }
        summary
    }

    async fn run_attempt(
        &self,
        record: FailedWebhook,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<RetryOutcome> {
        let attempt = record.attempt_count + 1;
        let result = self
            .invoke(handler, WebhookContext::from_record(&record))
            .await;
        let now = self.clock.now();

        let err = match result {
            Ok(()) => {
                if !self.store.mark_succeeded(record.id, attempt, now).await? {
                    warn!(webhook_id = record.id, "webhook claim lost before success was recorded");
                }
                info!(
                    webhook_id = record.id,
                    webhook_type = %record.webhook_type,
                    attempt,
                    "webhook retry succeeded"
                );
                return Ok(RetryOutcome::Succeeded {
                    attempt_count: attempt,
                });
            }
            Err(err) => err,
        };

        let failure = FailureDetails::from(&err);
        if attempt >= record.max_attempts {
            self.store
                .record_failure(
                    record.id,
                    AttemptFailure {
                        attempt_count: attempt,
                        error_message: failure.message,
                        error_stack: failure.stack,
                        next_retry_at: None,
                    },
                    now,
                )
                .await?;
            quarantine(self.store.as_ref(), record.id, MAX_ATTEMPTS_EXCEEDED, now).await?;
            return Ok(RetryOutcome::DeadLettered {
                attempt_count: attempt,
            });
        }

        let next_retry_at = add_delay(now, self.policy.delay_for(attempt));
        self.store
            .record_failure(
                record.id,
                AttemptFailure {
                    attempt_count: attempt,
                    error_message: failure.message,
                    error_stack: failure.stack,
                    next_retry_at: Some(next_retry_at),
                },
                now,
            )
            .await?;
        warn!(
            webhook_id = record.id,
            webhook_type = %record.webhook_type,
            attempt,
            max_attempts = record.max_attempts,
            next_retry_at = %next_retry_at,
            error = %err,
            "webhook retry failed, rescheduled"
        );
        Ok(RetryOutcome::Rescheduled {
            attempt_count: attempt,
            next_retry_at,
        })
    }

    /// Runs the handler in its own task under the configured timeout. A panic
    /// or a timeout is reported as a handler failure.
    async fn invoke(
        &self,
        handler: Arc<dyn WebhookHandler>,
        ctx: WebhookContext,
    ) -> anyhow::Result<()> {
        let timeout = self.policy.handler_timeout;
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(anyhow!("webhook handler panicked")),
            Ok(Err(join_err)) => Err(anyhow!("webhook handler task failed: {join_err}")),
            Err(_) => {
                task.abort();
                Err(anyhow!("webhook handler timed out after {}ms", timeout.as_millis()))
            }
        }
    }
}
