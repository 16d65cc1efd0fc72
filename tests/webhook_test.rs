mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use webhook_reliability::database::{AttemptFailure, WebhookStore};
use webhook_reliability::error::Error;
use webhook_reliability::models::failed_webhook::WebhookStatus;
use webhook_reliability::services::retry_service::{BatchSummary, RetryOutcome};
use webhook_reliability::services::webhook_handler::{
    handler_fn, HandlerRegistry, WebhookContext,
};
use webhook_reliability::utils::time::Clock;

use common::{always_fail, always_ok, counting, fast_policy, Harness};

#[tokio::test]
async fn intake_stamps_policy_and_first_delay() {
    let h = Harness::new(fast_policy(3));
    let start = h.clock.now();
    let record = h.store_webhook("order_paid").await;

    assert_eq!(record.status, WebhookStatus::Pending);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.max_attempts, 3);
    assert_eq!(record.next_retry_at, start + chrono::Duration::milliseconds(1000));
    assert_eq!(record.error_message, "downstream unavailable");
    assert_eq!(record.header_map()["x-shop-topic"], "order_paid");
}

#[tokio::test]
async fn order_paid_exhausts_retries_into_dead_letter_queue() {
    let h = Harness::new(fast_policy(3));
    let handlers = HandlerRegistry::new().with("order_paid", always_fail());
    let record = h.store_webhook("order_paid").await;
    let dlq_before = h.dlq.get_dead_letter_queue_count(None).await.unwrap();

    // Not due yet.
    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(summary.processed, 0);

    h.advance(Duration::from_millis(1000));
    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(summary.rescheduled, 1);
    let after_first = h.reload(record.id).await;
    assert_eq!(after_first.status, WebhookStatus::Pending);
    assert_eq!(after_first.attempt_count, 1);
    assert_eq!(
        after_first.next_retry_at,
        h.clock.now() + chrono::Duration::milliseconds(2000)
    );

    h.advance(Duration::from_millis(2000));
    h.retry.process_pending_webhooks(&handlers).await;
    let after_second = h.reload(record.id).await;
    assert_eq!(after_second.status, WebhookStatus::Pending);
    assert_eq!(after_second.attempt_count, 2);

    h.advance(Duration::from_millis(4000));
    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(
        summary,
        BatchSummary {
            processed: 1,
            succeeded: 0,
            failed: 1,
            rescheduled: 0,
        }
    );

    let final_record = h.reload(record.id).await;
    assert_eq!(final_record.status, WebhookStatus::Failed);
    assert_eq!(final_record.attempt_count, 3);
    assert_eq!(
        h.dlq.get_dead_letter_queue_count(None).await.unwrap(),
        dlq_before + 1
    );

    let entries = h
        .dlq
        .get_dead_letter_queue(50, 0, Some("order_paid"))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, record.id);
}

#[tokio::test]
async fn exhausted_record_keeps_error_history() {
    let h = Harness::new(fast_policy(1));
    let handlers = HandlerRegistry::new().with("order_paid", always_fail());
    let record = h.store_webhook("order_paid").await;

    h.advance(Duration::from_secs(1));
    h.retry.process_pending_webhooks(&handlers).await;

    let failed = h.reload(record.id).await;
    assert_eq!(failed.status, WebhookStatus::Failed);
    assert_eq!(
        failed.error_message,
        "payment gateway returned 503 | max attempts exceeded"
    );
}

#[tokio::test]
async fn first_due_success_leaves_pending_set() {
    let h = Harness::new(fast_policy(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new().with("order_paid", counting(calls.clone(), true));
    let record = h.store_webhook("order_paid").await;

    h.advance(Duration::from_secs(1));
    assert_eq!(h.retry.get_pending_webhooks(10).await.len(), 1);

    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let done = h.reload(record.id).await;
    assert_eq!(done.status, WebhookStatus::Succeeded);
    assert_eq!(done.attempt_count, 1);

    h.advance(Duration::from_secs(3600));
    assert!(h.retry.get_pending_webhooks(10).await.is_empty());
    h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unroutable_webhook_fails_without_backoff() {
    let h = Harness::new(fast_policy(3));
    let record = h.store_webhook("refund_issued").await;

    h.advance(Duration::from_secs(1));
    let summary = h
        .retry
        .process_pending_webhooks(&HandlerRegistry::new())
        .await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);

    let failed = h.reload(record.id).await;
    assert_eq!(failed.status, WebhookStatus::Failed);
    assert_eq!(failed.attempt_count, 0);
    assert!(failed
        .error_message
        .contains("no handler registered for webhook type 'refund_issued'"));
}

#[tokio::test]
async fn pending_excludes_future_records_and_keeps_due_order() {
    let h = Harness::new(fast_policy(3));
    let first = h.store_webhook("order_paid").await;
    h.advance(Duration::from_millis(100));
    let second = h.store_webhook("patient_created").await;
    h.advance(Duration::from_millis(500));
    let later = h.store_webhook("order_paid").await;

    // now = start + 1.1s: first and second are due, later is not.
    h.advance(Duration::from_millis(500));
    let pending = h.retry.get_pending_webhooks(10).await;
    let ids: Vec<i64> = pending.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert!(!ids.contains(&later.id));
    assert!(pending
        .iter()
        .all(|r| r.next_retry_at <= h.clock.now()));

    let limited = h.retry.get_pending_webhooks(1).await;
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, first.id);
}

#[tokio::test]
async fn dead_lettered_record_cannot_be_forced_back_to_pending() {
    let h = Harness::new(fast_policy(1));
    let handlers = HandlerRegistry::new().with("order_paid", always_fail());
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));
    h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Failed);

    let err = h
        .retry
        .update_webhook_status(record.id, WebhookStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let still_dead = h.reload(record.id).await;
    assert_eq!(still_dead.status, WebhookStatus::Failed);
    assert_eq!(still_dead.attempt_count, 1);
    assert_eq!(h.dlq.get_dead_letter_queue_count(None).await.unwrap(), 1);
    h.advance(Duration::from_secs(3600));
    assert!(h.retry.get_pending_webhooks(10).await.is_empty());
}

#[tokio::test]
async fn succeeded_record_status_is_final() {
    let h = Harness::new(fast_policy(3));
    let handlers = HandlerRegistry::new().with("order_paid", always_ok());
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));
    h.retry.process_pending_webhooks(&handlers).await;

    for status in [WebhookStatus::Pending, WebhookStatus::Failed] {
        let err = h
            .retry
            .update_webhook_status(record.id, status)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Succeeded);
}

#[tokio::test]
async fn record_without_attempts_left_is_not_retried() {
    let h = Harness::new(fast_policy(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));

    // A stale snapshot claiming the budget is spent.
    let mut spent = record.clone();
    spent.attempt_count = spent.max_attempts;
    let err = h
        .retry
        .process_webhook_retry(&spent, counting(calls.clone(), false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Exhaust it for real, then retry from the up-to-date record.
    h.retry
        .process_webhook_retry(&record, counting(calls.clone(), false))
        .await
        .unwrap();
    let dead = h.reload(record.id).await;
    assert_eq!(dead.attempt_count, 1);
    assert!(h
        .retry
        .process_webhook_retry(&dead, counting(calls.clone(), false))
        .await
        .is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.reload(record.id).await.attempt_count, 1);
}

#[tokio::test]
async fn one_bad_record_does_not_abort_the_batch() {
    let mut policy = fast_policy(3);
    policy.handler_timeout = Duration::from_millis(100);
    let h = Harness::new(policy);

    let handlers = HandlerRegistry::new()
        .with("order_paid", always_ok())
        .with("patient_created", always_fail())
        .with(
            "refund_issued",
            handler_fn(|ctx: WebhookContext| async move {
                if ctx.webhook_type == "refund_issued" {
                    panic!("handler bug");
                }
                Ok(())
            }),
        )
        .with(
            "shipment_created",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        );

    let ok = h.store_webhook("order_paid").await;
    let failing = h.store_webhook("patient_created").await;
    let panicking = h.store_webhook("refund_issued").await;
    let hung = h.store_webhook("shipment_created").await;

    h.advance(Duration::from_secs(1));
    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(
        summary,
        BatchSummary {
            processed: 4,
            succeeded: 1,
            failed: 0,
            rescheduled: 3,
        }
    );

    assert_eq!(h.reload(ok.id).await.status, WebhookStatus::Succeeded);
    assert_eq!(h.reload(failing.id).await.status, WebhookStatus::Pending);

    let panicked = h.reload(panicking.id).await;
    assert_eq!(panicked.status, WebhookStatus::Pending);
    assert_eq!(panicked.error_message, "webhook handler panicked");

    let timed_out = h.reload(hung.id).await;
    assert_eq!(timed_out.attempt_count, 1);
    assert_eq!(timed_out.error_message, "webhook handler timed out after 100ms");
}

#[tokio::test]
async fn stale_claim_is_released_and_retried() {
    let h = Harness::new(fast_policy(3));
    let handlers = HandlerRegistry::new().with("order_paid", always_ok());
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));

    // A worker claims the record and dies before recording an outcome.
    let claimed = h.store.claim_due(h.clock.now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(summary.processed, 0);
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Processing);

    h.advance(Duration::from_secs(301));
    let summary = h.retry.process_pending_webhooks(&handlers).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Succeeded);
}

#[tokio::test]
async fn stale_claim_with_spent_attempts_is_dead_lettered_with_reason() {
    let h = Harness::new(fast_policy(1));
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));

    // The worker records its last failure and dies before the dead-letter move.
    let now = h.clock.now();
    h.store.claim_due(now, 10).await.unwrap();
    h.store
        .record_failure(
            record.id,
            AttemptFailure {
                attempt_count: 1,
                error_message: "payment gateway returned 503".to_string(),
                error_stack: None,
                next_retry_at: None,
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Processing);

    h.advance(Duration::from_secs(301));
    let summary = h.retry.process_pending_webhooks(&HandlerRegistry::new()).await;
    assert_eq!(summary.processed, 0);

    let dead = h.reload(record.id).await;
    assert_eq!(dead.status, WebhookStatus::Failed);
    assert_eq!(
        dead.error_message,
        "payment gateway returned 503 | max attempts exceeded"
    );
    assert_eq!(h.dlq.get_dead_letter_queue_count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let h = Harness::new(fast_policy(3));
    for _ in 0..5 {
        h.store_webhook("order_paid").await;
    }
    h.advance(Duration::from_secs(1));
    let now = h.clock.now();

    let (a, b) = tokio::join!(h.store.claim_due(now, 10), h.store.claim_due(now, 10));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len() + b.len(), 5);
    assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));
    assert!(a
        .iter()
        .chain(b.iter())
        .all(|r| r.status == WebhookStatus::Processing));
}

#[tokio::test]
async fn terminal_records_cannot_be_retried() {
    let h = Harness::new(fast_policy(3));
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));

    let outcome = h
        .retry
        .process_webhook_retry(&record, always_ok())
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Succeeded { attempt_count: 1 });

    let done = h.reload(record.id).await;
    let err = h
        .retry
        .process_webhook_retry(&done, always_ok())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn single_retry_reports_backoff_schedule() {
    let h = Harness::new(fast_policy(3));
    let record = h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));

    let outcome = h
        .retry
        .process_webhook_retry(&record, always_fail())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RetryOutcome::Rescheduled {
            attempt_count: 1,
            next_retry_at: h.clock.now() + chrono::Duration::seconds(2),
        }
    );
    assert_eq!(h.retry.calculate_retry_delay(1), Duration::from_secs(2));
}

#[tokio::test]
async fn live_dispatch_records_only_failures() {
    let h = Harness::new(fast_policy(3));
    let ctx = WebhookContext::new(
        "order_paid",
        json!({ "order_id": 7 }),
        HashMap::from([("X-Shop-Topic".to_string(), "orders/paid".to_string())]),
    );

    assert!(
        h.retry
            .dispatch_or_record(ctx.clone(), always_ok(), "/webhooks/shop")
            .await
    );
    assert!(h.store.is_empty());

    assert!(
        !h.retry
            .dispatch_or_record(ctx, always_fail(), "/webhooks/shop")
            .await
    );
    let pending = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(pending.status, WebhookStatus::Pending);
    assert_eq!(pending.attempt_count, 0);
    assert_eq!(pending.payload["order_id"], 7);
    assert_eq!(pending.error_message, "payment gateway returned 503");
}

#[tokio::test]
async fn storage_outage_degrades_quietly() {
    let h = Harness::new(fast_policy(3));
    h.store_webhook("order_paid").await;
    h.advance(Duration::from_secs(1));
    h.store.set_unavailable(true);

    let err = anyhow::anyhow!("boom");
    let stored = h
        .retry
        .store_failed_webhook("order_paid", "/webhooks/shop", json!({}), &HashMap::new(), &err)
        .await;
    assert!(stored.is_none());
    assert!(h.retry.get_pending_webhooks(10).await.is_empty());

    let handlers = HandlerRegistry::new().with("order_paid", always_ok());
    assert_eq!(
        h.retry.process_pending_webhooks(&handlers).await,
        BatchSummary::default()
    );

    h.store.set_unavailable(false);
    assert_eq!(h.retry.process_pending_webhooks(&handlers).await.succeeded, 1);
}

#[tokio::test]
async fn status_override_reports_missing_records() {
    let h = Harness::new(fast_policy(3));
    let record = h.store_webhook("order_paid").await;

    assert!(h
        .retry
        .update_webhook_status(record.id, WebhookStatus::Processing)
        .await
        .unwrap());
    assert_eq!(h.reload(record.id).await.status, WebhookStatus::Processing);
    assert!(!h
        .retry
        .update_webhook_status(9_999, WebhookStatus::Failed)
        .await
        .unwrap());
}
