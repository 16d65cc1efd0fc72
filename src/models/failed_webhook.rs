use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, FromRow, Row};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Current version of the stored `payload`/`headers` envelope.
pub const PAYLOAD_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl WebhookStatus {
    pub const ALL: [WebhookStatus; 4] = [
        WebhookStatus::Pending,
        WebhookStatus::Processing,
        WebhookStatus::Succeeded,
        WebhookStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Succeeded => "succeeded",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WebhookStatus::Succeeded | WebhookStatus::Failed)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown webhook status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for WebhookStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WebhookStatus::Pending),
            "processing" => Ok(WebhookStatus::Processing),
            "succeeded" => Ok(WebhookStatus::Succeeded),
            "failed" => Ok(WebhookStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedWebhook {
    pub id: i64,
    pub webhook_type: String,
    pub webhook_url: String,
    pub payload: JsonValue,
    pub headers: Option<JsonValue>,
    pub schema_version: i32,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub status: WebhookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedWebhook {
    /// Headers as a flat string map. Non-string values are rendered as JSON.
    pub fn header_map(&self) -> HashMap<String, String> {
        match &self.headers {
            Some(JsonValue::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            _ => HashMap::new(),
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

impl<'r> FromRow<'r, PgRow> for FailedWebhook {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status.parse().map_err(|e: ParseStatusError| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            webhook_type: row.try_get("webhook_type")?,
            webhook_url: row.try_get("webhook_url")?,
            payload: row.try_get("payload")?,
            headers: row.try_get("headers")?,
            schema_version: row.try_get("schema_version")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            error_stack: row.try_get("error_stack")?,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A record about to be inserted by the intake path.
#[derive(Debug, Clone)]
pub struct NewFailedWebhook {
    pub webhook_type: String,
    pub webhook_url: String,
    pub payload: JsonValue,
    pub headers: Option<JsonValue>,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub error_message: String,
    pub error_stack: Option<String>,
}

/// Lowercases header names. Names that differ only in case are merged into
/// one comma-separated value, in name order, the way repeated HTTP header
/// fields combine.
pub fn lowercase_headers(headers: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut entries: Vec<(&String, &String)> = headers.iter().collect();
    entries.sort();
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in entries {
        merged
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    merged
}

pub fn headers_to_json(headers: &HashMap<String, String>) -> Option<JsonValue> {
    if headers.is_empty() {
        return None;
    }
    let map = lowercase_headers(headers)
        .into_iter()
        .map(|(k, v)| (k, JsonValue::String(v)))
        .collect();
    Some(JsonValue::Object(map))
}
