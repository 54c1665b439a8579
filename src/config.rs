use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::execution::{ExecutionOptions, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Checkpoint store path; `sqlite:` and `sqlite://` prefixes are accepted
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub max_concurrency: usize,
    pub max_task_attempts: u32,
    /// Age after which another process's execution lock is taken over
    pub lock_stale_after_secs: u64,
    pub graph_cache_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("storage.url", "./privacy_requests.db")?
            .set_default("execution.max_concurrency", num_cpus::get().clamp(2, 32) as u64)?
            .set_default("execution.max_task_attempts", 3)?
            .set_default("execution.lock_stale_after_secs", 3600)?
            .set_default("execution.graph_cache_entries", 16)?
            .set_default("retry.max_retries", 3)?
            .set_default("retry.base_delay_ms", 500)?
            .set_default("retry.backoff_factor", 2.0)?
            .set_default("retry.max_delay_ms", 60_000)?
            .set_default("retry.jitter", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        // Load from environment variables
        if let Ok(db_url) = env::var("PRIVACY_ENGINE_DB_URL") {
            builder = builder.set_override("storage.url", db_url)?;
        }

        if let Ok(concurrency) = env::var("PRIVACY_ENGINE_MAX_CONCURRENCY") {
            builder = builder.set_override(
                "execution.max_concurrency",
                parse_number("PRIVACY_ENGINE_MAX_CONCURRENCY", &concurrency)?,
            )?;
        }

        if let Ok(attempts) = env::var("PRIVACY_ENGINE_MAX_TASK_ATTEMPTS") {
            builder = builder.set_override(
                "execution.max_task_attempts",
                parse_number("PRIVACY_ENGINE_MAX_TASK_ATTEMPTS", &attempts)?,
            )?;
        }

        if let Ok(retries) = env::var("PRIVACY_ENGINE_MAX_RETRIES") {
            builder = builder.set_override(
                "retry.max_retries",
                parse_number("PRIVACY_ENGINE_MAX_RETRIES", &retries)?,
            )?;
        }

        if let Ok(delay) = env::var("PRIVACY_ENGINE_RETRY_BASE_DELAY_MS") {
            builder = builder.set_override(
                "retry.base_delay_ms",
                parse_number("PRIVACY_ENGINE_RETRY_BASE_DELAY_MS", &delay)?,
            )?;
        }

        if let Ok(delay) = env::var("PRIVACY_ENGINE_RETRY_MAX_DELAY_MS") {
            builder = builder.set_override(
                "retry.max_delay_ms",
                parse_number("PRIVACY_ENGINE_RETRY_MAX_DELAY_MS", &delay)?,
            )?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_concurrency: self.execution.max_concurrency.max(1),
            max_task_attempts: self.execution.max_task_attempts.max(1),
            retry: self.retry_policy(),
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.execution.lock_stale_after_secs)
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64, config::ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| config::ConfigError::Message(format!("{} must be a non-negative integer: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 7] = [
        "PRIVACY_ENGINE_DB_URL",
        "PRIVACY_ENGINE_MAX_CONCURRENCY",
        "PRIVACY_ENGINE_MAX_TASK_ATTEMPTS",
        "PRIVACY_ENGINE_MAX_RETRIES",
        "PRIVACY_ENGINE_RETRY_BASE_DELAY_MS",
        "PRIVACY_ENGINE_RETRY_MAX_DELAY_MS",
        "RUST_LOG_STYLE",
    ];

    // Both cases touch the process environment, so they run as one test
    #[test]
    fn test_config_defaults_and_overrides() {
        for var in VARS {
            env::remove_var(var);
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.storage.url, "./privacy_requests.db");
        assert_eq!(config.execution.max_task_attempts, 3);
        assert!((2..=32).contains(&config.execution.max_concurrency));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_delay_ms, 60_000);
        assert_eq!(config.logging.style, "auto");

        let retry = config.retry_policy();
        assert_eq!(retry.base_delay, Duration::from_millis(500));
        assert!(retry.jitter);

        env::set_var("PRIVACY_ENGINE_DB_URL", "sqlite://./other.db");
        env::set_var("PRIVACY_ENGINE_MAX_CONCURRENCY", "7");
        env::set_var("PRIVACY_ENGINE_MAX_RETRIES", "0");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.storage.url, "sqlite://./other.db");
        let options = config.execution_options();
        assert_eq!(options.max_concurrency, 7);
        assert_eq!(options.retry.max_retries, 0);

        env::set_var("PRIVACY_ENGINE_MAX_CONCURRENCY", "many");
        assert!(EngineConfig::from_env().is_err());

        for var in VARS {
            env::remove_var(var);
        }
    }
}
