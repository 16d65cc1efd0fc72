pub mod memory_store;
pub mod pool;
pub mod postgres_store;
pub mod webhook_store;

pub use memory_store::InMemoryWebhookStore;
pub use postgres_store::PgWebhookStore;
pub use webhook_store::{AttemptFailure, DeadLetterFilter, WebhookStore};
