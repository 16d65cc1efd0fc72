use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use validator::Validate;

use crate::{
    dto::webhook_dto::{PendingQuery, StoreFailedWebhookPayload, UpdateStatusPayload},
    error::{Error, Result},
    extract::{ApiJson, ApiPath, ApiQuery},
    services::retry_service::FailureDetails,
    AppState,
};

/// Lets a sibling service hand over a webhook whose live handling failed.
pub async fn store_failed_webhook(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<StoreFailedWebhookPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let headers = payload.headers.unwrap_or_default();
    let stored = state
        .retry_service
        .store_failed_webhook(
            &payload.webhook_type,
            &payload.webhook_url,
            payload.payload,
            &headers,
            FailureDetails::new(payload.error_message, payload.error_stack),
        )
        .await
        .ok_or_else(|| Error::Internal("Failed to store webhook for retry".to_string()))?;

    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_pending_webhooks(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PendingQuery>,
) -> Result<impl IntoResponse> {
    query.validate()?;
    let limit = query.limit.unwrap_or(state.retry_service.policy().batch_size);
    let items = state.retry_service.get_pending_webhooks(limit).await;
    let count = items.len();
    Ok(Json(json!({ "items": items, "count": count })))
}

#[axum::debug_handler]
pub async fn process_pending_webhooks(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let summary = state
        .retry_service
        .process_pending_webhooks(&state.handlers)
        .await;
    Ok(Json(summary))
}

pub async fn update_webhook_status(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(payload): ApiJson<UpdateStatusPayload>,
) -> Result<impl IntoResponse> {
    if !state
        .retry_service
        .update_webhook_status(id, payload.status)
        .await?
    {
        return Err(Error::NotFound(format!("Webhook {} not found", id)));
    }
    Ok(Json(json!({ "id": id, "status": payload.status })))
}
