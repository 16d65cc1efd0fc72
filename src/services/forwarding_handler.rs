use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::webhook_handler::{HandlerRegistry, WebhookContext, WebhookHandler};

/// Headers that describe the original transport, not the event.
const SKIPPED_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "content-type",
    "connection",
    "transfer-encoding",
];

/// Replays an event by POSTing its body to an internal endpoint.
#[derive(Clone)]
pub struct ForwardingHandler {
    client: Client,
    url: String,
    secret: String,
}

impl ForwardingHandler {
    pub fn new(client: Client, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            secret: secret.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WebhookHandler for ForwardingHandler {
    async fn handle(&self, ctx: WebhookContext) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.url);
        for (name, value) in &ctx.headers {
            if SKIPPED_HEADERS.contains(&name.as_str()) || name.starts_with("x-webhook-") {
                continue;
            }
            request = request.header(name, value);
        }

        let resp = request
            .header("X-Webhook-Secret", &self.secret)
            .header("X-Webhook-Type", &ctx.webhook_type)
            .header("X-Webhook-Replay", "true")
            .json(&ctx.body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!(
            "forward to {} returned {}: {}",
            self.url,
            status.as_u16(),
            body.chars().take(512).collect::<String>()
        )
    }
}

impl HandlerRegistry {
    /// One [`ForwardingHandler`] per `(webhook_type, url)` route.
    pub fn from_routes(routes: &[(String, String)], secret: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        let mut registry = HandlerRegistry::new();
        for (webhook_type, url) in routes {
            registry.register(
                webhook_type.clone(),
                Arc::new(ForwardingHandler::new(client.clone(), url.clone(), secret)),
            );
        }
        registry
    }
}
