use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::models::failed_webhook::{lowercase_headers, FailedWebhook};

/// What a handler sees, whether the event arrives live or from a retry.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    pub webhook_type: String,
    pub body: JsonValue,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    /// `body` serialized back to JSON. Stored payloads go through JSONB, which
    /// reorders keys and drops insignificant whitespace, so this is not the
    /// byte sequence the sender signed; verify signatures before intake.
    pub raw_body: Bytes,
}

impl WebhookContext {
    pub fn new(
        webhook_type: impl Into<String>,
        body: JsonValue,
        headers: HashMap<String, String>,
    ) -> Self {
        let raw_body = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
        let headers = lowercase_headers(&headers).into_iter().collect();
        Self {
            webhook_type: webhook_type.into(),
            body,
            headers,
            raw_body,
        }
    }

    pub fn from_record(record: &FailedWebhook) -> Self {
        Self::new(
            record.webhook_type.clone(),
            record.payload.clone(),
            record.header_map(),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Business logic for one webhook type. Returning `Err` schedules a retry.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, ctx: WebhookContext) -> anyhow::Result<()>;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WebhookHandler for FnHandler<F>
where
    F: Fn(WebhookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: WebhookContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WebhookHandler>
where
    F: Fn(WebhookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        webhook_type: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> &mut Self {
        self.handlers.insert(webhook_type.into(), handler);
        self
    }

    pub fn with(mut self, webhook_type: impl Into<String>, handler: Arc<dyn WebhookHandler>) -> Self {
        self.register(webhook_type, handler);
        self
    }

    pub fn get(&self, webhook_type: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(webhook_type).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
