pub mod dead_letter_service;
pub mod forwarding_handler;
pub mod retry_policy;
pub mod retry_service;
pub mod webhook_handler;
