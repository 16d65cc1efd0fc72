use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use validator::Validate;

use crate::{
    dto::webhook_dto::{DeadLetterCountQuery, DeadLetterPage, DeadLetterQuery},
    error::{Error, Result},
    extract::{ApiPath, ApiQuery},
    AppState,
};

pub async fn list_dead_letters(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DeadLetterQuery>,
) -> Result<impl IntoResponse> {
    query.validate()?;
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);
    let webhook_type = query.webhook_type.as_deref();

    let items = state
        .dead_letter_service
        .get_dead_letter_queue(limit, offset, webhook_type)
        .await?;
    let total = state
        .dead_letter_service
        .get_dead_letter_queue_count(webhook_type)
        .await?;

    Ok(Json(DeadLetterPage {
        items,
        total,
        limit,
        offset,
    }))
}

pub async fn count_dead_letters(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DeadLetterCountQuery>,
) -> Result<impl IntoResponse> {
    query.validate()?;
    let count = state
        .dead_letter_service
        .get_dead_letter_queue_count(query.webhook_type.as_deref())
        .await?;
    Ok(Json(json!({ "count": count })))
}

#[axum::debug_handler]
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse> {
    let record = state.dead_letter_service.get_dead_letter(id).await?;
    let handler = state.handlers.get(&record.webhook_type).ok_or_else(|| {
        Error::BadRequest(format!(
            "No handler registered for webhook type '{}'",
            record.webhook_type
        ))
    })?;

    let outcome = state.dead_letter_service.replay_webhook(id, handler).await?;
    Ok(Json(json!({ "id": id, "result": outcome })))
}

pub async fn delete_dead_letter(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse> {
    state
        .dead_letter_service
        .delete_from_dead_letter_queue(id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn webhook_statistics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let stats = state.dead_letter_service.get_webhook_statistics().await?;
    Ok(Json(stats))
}
