use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use validator::Validate;

use crate::models::failed_webhook::{FailedWebhook, WebhookStatus};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StoreFailedWebhookPayload {
    #[validate(length(min = 1, max = 100))]
    pub webhook_type: String,
    #[validate(length(min = 1))]
    pub webhook_url: String,
    pub payload: JsonValue,
    pub headers: Option<HashMap<String, String>>,
    #[validate(length(min = 1))]
    pub error_message: String,
    pub error_stack: Option<String>,
}

#[derive(Debug, Deserialize, Default, Validate)]
#[serde(default)]
pub struct PendingQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Validate)]
#[serde(default)]
pub struct DeadLetterQuery {
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    #[validate(range(min = 0))]
    pub offset: Option<i64>,
    #[validate(length(min = 1))]
    pub webhook_type: Option<String>,
}

#[derive(Debug, Deserialize, Default, Validate)]
#[serde(default)]
pub struct DeadLetterCountQuery {
    #[validate(length(min = 1))]
    pub webhook_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusPayload {
    pub status: WebhookStatus,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterPage {
    pub items: Vec<FailedWebhook>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
