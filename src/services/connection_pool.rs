use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod, Timeouts};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

use crate::error::{ConnectorError, EngineError};

/// Sizing and timeouts applied to every Postgres pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_size: usize,
    /// How long a connector waits for a free connection before the call counts as timed out
    pub wait_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 8,
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres pools shared by all connectors, one per database URL
///
/// Several datasets often live in the same database; they reuse one pool
/// instead of each connector opening its own.
pub struct ConnectionPoolManager {
    pools: RwLock<HashMap<String, Pool>>,
    settings: PoolSettings,
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::with_settings(PoolSettings::default())
    }

    pub fn with_settings(settings: PoolSettings) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Pool for `connection_url`, created on first use. Safe under concurrent callers.
    pub async fn get_or_create_pool(&self, connection_url: &str) -> Result<Pool, EngineError> {
        if let Some(pool) = self.pools.read().await.get(connection_url) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        // Another task may have won the race while we waited for the write lock
        if let Some(pool) = pools.get(connection_url) {
            return Ok(pool.clone());
        }

        let pool = self.build_pool(connection_url)?;
        pools.insert(connection_url.to_string(), pool.clone());
        tracing::info!(
            "Created Postgres pool for {} (max_size: {})",
            redact_url(connection_url),
            self.settings.max_size
        );
        Ok(pool)
    }

    fn build_pool(&self, connection_url: &str) -> Result<Pool, EngineError> {
        let mut cfg = PgConfig::new();
        cfg.url = Some(connection_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: self.settings.max_size,
            timeouts: Timeouts {
                wait: Some(self.settings.wait_timeout),
                ..Timeouts::default()
            },
            ..deadpool_postgres::PoolConfig::default()
        });

        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create Postgres pool for {}: {}", redact_url(connection_url), e);
                EngineError::Connector(ConnectorError::invalid_config(format!(
                    "Failed to create connection pool: {}",
                    e
                )))
            })
    }

    /// Drop the pool for a URL; in-flight connections finish normally
    pub async fn remove_pool(&self, connection_url: &str) -> bool {
        let removed = self.pools.write().await.remove(connection_url).is_some();
        if removed {
            tracing::info!("Removed Postgres pool for {}", redact_url(connection_url));
        }
        removed
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the password in a connection URL so it can be logged
pub(crate) fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}
