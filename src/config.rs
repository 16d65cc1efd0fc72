use crate::error::{Error, Result};
use crate::services::retry_policy::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub webhook_secret: String,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_attempts: i32,
    pub retry_batch_size: i64,
    pub handler_timeout_secs: u64,
    pub processing_lease_secs: u64,
    pub retry_cron: String,
    pub handler_routes: Vec<(String, String)>,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let max_attempts: i32 = get_env_or("WEBHOOK_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts < 1 {
            return Err(Error::Config(
                "WEBHOOK_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let config = Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            database_max_connections: get_env_or("DATABASE_MAX_CONNECTIONS", 20)?,
            jwt_secret: get_env("JWT_SECRET")?,
            webhook_secret: get_env("WEBHOOK_SECRET")?,
            retry_initial_delay_ms: get_env_or("WEBHOOK_RETRY_INITIAL_DELAY_MS", 60_000)?,
            retry_max_delay_ms: get_env_or("WEBHOOK_RETRY_MAX_DELAY_MS", 3_600_000)?,
            max_attempts,
            retry_batch_size: get_env_or("WEBHOOK_RETRY_BATCH_SIZE", 20)?,
            handler_timeout_secs: get_env_or("WEBHOOK_HANDLER_TIMEOUT_SECS", 30)?,
            processing_lease_secs: get_env_or("WEBHOOK_PROCESSING_LEASE_SECS", 900)?,
            retry_cron: env::var("WEBHOOK_RETRY_CRON").unwrap_or_else(|_| "0 * * * * *".into()),
            handler_routes: parse_handler_routes(
                &env::var("WEBHOOK_HANDLER_ROUTES").unwrap_or_default(),
            )?,
        };
        validate_retry_policy(&config.retry_policy())?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: self.max_attempts,
            batch_size: self.retry_batch_size,
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            processing_lease: Duration::from_secs(self.processing_lease_secs),
        }
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

/// A claim must outlive the whole batch it was taken in: records are handled
/// one after another, so the last one may wait `batch_size` handler timeouts.
pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.batch_size < 1 {
        return Err(Error::Config(
            "WEBHOOK_RETRY_BATCH_SIZE must be at least 1".to_string(),
        ));
    }
    let batch_budget = policy
        .handler_timeout
        .saturating_mul(u32::try_from(policy.batch_size).unwrap_or(u32::MAX));
    if policy.processing_lease <= batch_budget {
        return Err(Error::Config(format!(
            "WEBHOOK_PROCESSING_LEASE_SECS ({}s) must exceed WEBHOOK_RETRY_BATCH_SIZE x WEBHOOK_HANDLER_TIMEOUT_SECS ({}s)",
            policy.processing_lease.as_secs(),
            batch_budget.as_secs()
        )));
    }
    Ok(())
}

/// Parses `order_paid=http://orders/internal/paid,patient_created=http://ehr/hooks`.
pub fn parse_handler_routes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (webhook_type, url) = entry.split_once('=').ok_or_else(|| {
                Error::Config(format!("Invalid handler route (expected type=url): {}", entry))
            })?;
            let (webhook_type, url) = (webhook_type.trim(), url.trim());
            if webhook_type.is_empty() || url.is_empty() {
                return Err(Error::Config(format!("Invalid handler route: {}", entry)));
            }
            Ok((webhook_type.to_string(), url.to_string()))
        })
        .collect()
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
