pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use crate::config::Config;
use crate::database::{PgWebhookStore, WebhookStore};
use crate::services::{
    dead_letter_service::DeadLetterService, retry_service::WebhookRetryService,
    webhook_handler::HandlerRegistry,
};
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub retry_service: WebhookRetryService,
    pub dead_letter_service: DeadLetterService,
    pub handlers: Arc<HandlerRegistry>,
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(
        retry_service: WebhookRetryService,
        handlers: HandlerRegistry,
        jwt_secret: impl Into<String>,
    ) -> Self {
        let dead_letter_service = DeadLetterService::new(retry_service.clone());
        Self {
            retry_service,
            dead_letter_service,
            handlers: Arc::new(handlers),
            jwt_secret: Arc::from(jwt_secret.into()),
        }
    }

    pub fn from_config(pool: PgPool, config: &Config) -> Self {
        let store: Arc<dyn WebhookStore> = Arc::new(PgWebhookStore::new(pool));
        let policy = config.retry_policy();
        let handlers = HandlerRegistry::from_routes(
            &config.handler_routes,
            &config.webhook_secret,
            policy.handler_timeout,
        );
        Self::new(
            WebhookRetryService::new(store, policy),
            handlers,
            config.jwt_secret.clone(),
        )
    }
}
