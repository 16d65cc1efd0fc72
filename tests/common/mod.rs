#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use webhook_reliability::database::{InMemoryWebhookStore, WebhookStore};
use webhook_reliability::models::failed_webhook::FailedWebhook;
use webhook_reliability::services::{
    dead_letter_service::DeadLetterService,
    retry_policy::RetryPolicy,
    retry_service::WebhookRetryService,
    webhook_handler::{handler_fn, WebhookHandler},
};
use webhook_reliability::utils::time::ManualClock;

pub struct Harness {
    pub store: Arc<InMemoryWebhookStore>,
    pub clock: Arc<ManualClock>,
    pub retry: WebhookRetryService,
    pub dlq: DeadLetterService,
}

impl Harness {
    pub fn new(policy: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryWebhookStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let retry = WebhookRetryService::with_clock(
            store.clone() as Arc<dyn WebhookStore>,
            policy,
            clock.clone(),
        );
        let dlq = DeadLetterService::new(retry.clone());
        Self {
            store,
            clock,
            retry,
            dlq,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn store_webhook(&self, webhook_type: &str) -> FailedWebhook {
        let err = anyhow::anyhow!("downstream unavailable");
        self.retry
            .store_failed_webhook(
                webhook_type,
                "/webhooks/shop",
                json!({ "type": webhook_type, "order_id": 1001 }),
                &HashMap::from([("X-Shop-Topic".to_string(), webhook_type.to_string())]),
                &err,
            )
            .await
            .expect("webhook stored")
    }

    pub async fn reload(&self, id: i64) -> FailedWebhook {
        self.store
            .get(id)
            .await
            .expect("store readable")
            .expect("record exists")
    }
}

/// 1s initial delay, 60s cap.
pub fn fast_policy(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1000),
        max_delay: Duration::from_secs(60),
        max_attempts,
        batch_size: 20,
        handler_timeout: Duration::from_secs(2),
        processing_lease: Duration::from_secs(300),
    }
}

pub fn always_fail() -> Arc<dyn WebhookHandler> {
    handler_fn(|_| async { Err(anyhow::anyhow!("payment gateway returned 503")) })
}

pub fn always_ok() -> Arc<dyn WebhookHandler> {
    handler_fn(|_| async { Ok(()) })
}

pub fn counting(calls: Arc<AtomicUsize>, succeed: bool) -> Arc<dyn WebhookHandler> {
    handler_fn(move |_| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok(())
            } else {
                Err(anyhow::anyhow!("handler failed"))
            }
        }
    })
}
