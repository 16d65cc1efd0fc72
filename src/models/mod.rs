pub mod failed_webhook;
pub mod webhook_stats;
