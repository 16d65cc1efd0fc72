pub mod dead_letter;
pub mod health;
pub mod webhook;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use crate::{middleware::auth::require_operator, AppState};

/// Operational API for the webhook retry engine, behind operator auth.
pub fn admin_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/api/admin/webhooks/failed",
            post(webhook::store_failed_webhook),
        )
        .route(
            "/api/admin/webhooks/pending",
            get(webhook::list_pending_webhooks),
        )
        .route(
            "/api/admin/webhooks/process",
            post(webhook::process_pending_webhooks),
        )
        .route(
            "/api/admin/webhooks/:id/status",
            patch(webhook::update_webhook_status),
        )
        .route(
            "/api/admin/webhooks/dead-letter",
            get(dead_letter::list_dead_letters),
        )
        .route(
            "/api/admin/webhooks/dead-letter/count",
            get(dead_letter::count_dead_letters),
        )
        .route(
            "/api/admin/webhooks/dead-letter/:id/replay",
            post(dead_letter::replay_dead_letter),
        )
        .route(
            "/api/admin/webhooks/dead-letter/:id",
            delete(dead_letter::delete_dead_letter),
        )
        .route(
            "/api/admin/webhooks/stats",
            get(dead_letter::webhook_statistics),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(admin)
        .with_state(state)
}
