// Connector abstraction
//
// Every collection is served by a connector exposing a uniform fetch/mask
// contract. The engine never looks behind it.

pub mod http;
pub mod manual;
pub mod postgres;
pub mod sqlite;

pub use http::HttpConnector;
pub use manual::ManualTaskConnector;
pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ConnectorError, EngineError};
use crate::models::{CollectionAddress, FieldPath, MaskingStrategy, PlannedNode, Row};
use crate::services::{ConnectionPoolManager, ManualTaskService};

/// Handle to the external task a suspended node is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: String,
    pub collection: CollectionAddress,
}

/// Result of an access call
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready(Vec<Row>),
    /// Ran and found nothing
    Empty,
    AwaitingExternalInput(TaskRef),
}

impl FetchOutcome {
    /// `Ready(vec![])` collapses to `Empty`
    pub fn from_rows(rows: Vec<Row>) -> Self {
        if rows.is_empty() {
            FetchOutcome::Empty
        } else {
            FetchOutcome::Ready(rows)
        }
    }
}

/// Result of an erasure call
#[derive(Debug, Clone, PartialEq)]
pub enum MaskOutcome {
    Masked(usize),
    AwaitingExternalInput(TaskRef),
}

/// Inputs for one access call
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub request_id: String,
    pub node: PlannedNode,
    /// Values to match, keyed by the field they are matched against
    pub inputs: BTreeMap<FieldPath, Vec<Value>>,
}

/// One field to mask and how
#[derive(Debug, Clone, PartialEq)]
pub struct MaskTarget {
    pub path: FieldPath,
    pub strategy: MaskingStrategy,
}

/// Inputs for one erasure call
#[derive(Debug, Clone)]
pub struct MaskRequest {
    pub request_id: String,
    pub node: PlannedNode,
    /// Rows previously fetched for this collection
    pub rows: Vec<Row>,
    pub targets: Vec<MaskTarget>,
}

/// Connector trait - uniform boundary to one backend family
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    /// Fetch rows of the node's collection matching any of the inputs
    async fn fetch_rows(&self, request: &FetchRequest) -> Result<FetchOutcome, ConnectorError>;

    /// Mask the target fields of the given rows
    async fn mask_rows(&self, request: &MaskRequest) -> Result<MaskOutcome, ConnectorError>;

    async fn test_connection(&self) -> Result<(), ConnectorError>;

    /// Whether erasure needs a primary key to address rows
    fn requires_primary_keys(&self) -> bool {
        true
    }
}

/// Connector type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Postgres,
    Sqlite,
    Http,
    Manual,
}

impl ConnectorType {
    pub fn from_str(s: &str) -> Result<Self, EngineError> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(ConnectorType::Postgres),
            "sqlite" => Ok(ConnectorType::Sqlite),
            "http" | "saas" => Ok(ConnectorType::Http),
            "manual" => Ok(ConnectorType::Manual),
            _ => Err(EngineError::Validation(format!("Unsupported connector type: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Postgres => "postgres",
            ConnectorType::Sqlite => "sqlite",
            ConnectorType::Http => "http",
            ConnectorType::Manual => "manual",
        }
    }
}

/// Connection settings for one registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registry key, matched against `Dataset::connection_key`
    pub key: String,
    pub connector_type: ConnectorType,
    /// Database URL, SQLite path or HTTP base URL; unused for manual connectors
    #[serde(default)]
    pub url: String,
    /// Extra HTTP headers, e.g. `Authorization`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Factory function to create the connector for a connection config
///
/// Postgres connectors share pools through the pool manager; manual
/// connectors need the manual task service.
pub async fn create_connector(
    config: &ConnectionConfig,
    pool_manager: Arc<ConnectionPoolManager>,
    manual_tasks: Option<Arc<ManualTaskService>>,
) -> Result<Arc<dyn Connector>, EngineError> {
    let timeout_secs = config.timeout_secs.unwrap_or(30);
    match config.connector_type {
        ConnectorType::Postgres => {
            let pool = pool_manager.get_or_create_pool(&config.url).await?;
            Ok(Arc::new(PostgresConnector::new(pool, &config.url, timeout_secs)?))
        }
        ConnectorType::Sqlite => Ok(Arc::new(SqliteConnector::open(&config.url)?)),
        ConnectorType::Http => Ok(Arc::new(HttpConnector::new(&config.url, &config.headers, timeout_secs)?)),
        ConnectorType::Manual => {
            let service = manual_tasks.ok_or_else(|| {
                EngineError::Config(format!(
                    "Connection '{}' is manual but no manual task service is configured",
                    config.key
                ))
            })?;
            Ok(Arc::new(ManualTaskConnector::new(service)))
        }
    }
}

/// Connection key -> connector
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every connector named in `configs`
    pub async fn from_configs(
        configs: &[ConnectionConfig],
        pool_manager: Arc<ConnectionPoolManager>,
        manual_tasks: Option<Arc<ManualTaskService>>,
    ) -> Result<Self, EngineError> {
        let mut registry = Self::new();
        for config in configs {
            let connector = create_connector(config, Arc::clone(&pool_manager), manual_tasks.clone()).await?;
            registry.register(&config.key, connector);
        }
        Ok(registry)
    }

    pub fn register(&mut self, key: &str, connector: Arc<dyn Connector>) {
        tracing::debug!("Registered {} connector '{}'", connector.connector_type().as_str(), key);
        self.connectors.insert(key.to_string(), connector);
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn Connector>, EngineError> {
        self.connectors
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("No connector registered for '{}'", key)))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Run `test_connection` on every registered connector
    pub async fn test_all(&self) -> Vec<(String, Result<(), ConnectorError>)> {
        let mut keys: Vec<&String> = self.connectors.keys().collect();
        keys.sort();
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.connectors[key].test_connection().await;
            if let Err(e) = &result {
                tracing::warn!("Connection test failed for '{}': {}", key, e);
            }
            results.push((key.clone(), result));
        }
        results
    }
}

/// Quote a SQL identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Inputs usable as SQL predicates: top-level columns with at least one value.
///
/// A nested input path has no column to compare against, so it fails the
/// node instead of silently dropping a constraint.
pub(crate) fn column_inputs<'a>(
    inputs: &'a BTreeMap<FieldPath, Vec<Value>>,
    connector: ConnectorType,
) -> Result<Vec<(&'a str, &'a [Value])>, ConnectorError> {
    let mut columns = Vec::new();
    for (path, values) in inputs.iter().filter(|(_, values)| !values.is_empty()) {
        match (path.len(), path.head()) {
            (1, Some(column)) => columns.push((column, values.as_slice())),
            _ => {
                return Err(ConnectorError::invalid_config(format!(
                    "Nested input field {} cannot be queried by the {} connector",
                    path,
                    connector.as_str()
                )))
            }
        }
    }
    Ok(columns)
}

/// Apply a masking strategy at `levels` inside `value`, descending through arrays
pub(crate) fn mask_in_place(value: &mut Value, levels: &[String], strategy: &MaskingStrategy) {
    match value {
        Value::Array(items) => {
            for item in items {
                mask_in_place(item, levels, strategy);
            }
        }
        Value::Object(map) => match levels.split_first() {
            Some((first, rest)) => {
                if let Some(next) = map.get_mut(first) {
                    if rest.is_empty() {
                        *next = strategy.mask(next);
                    } else {
                        mask_in_place(next, rest, strategy);
                    }
                }
            }
            None => *value = strategy.mask(value),
        },
        other => {
            if levels.is_empty() {
                *other = strategy.mask(other);
            }
        }
    }
}

/// Column name -> masked column value, for every target present in the row
pub(crate) fn masked_columns(row: &Row, targets: &[MaskTarget]) -> BTreeMap<String, Value> {
    let mut updates: BTreeMap<String, Value> = BTreeMap::new();
    for target in targets {
        let Some(column) = target.path.head() else {
            continue;
        };
        let Some(current) = updates.get(column).cloned().or_else(|| row.get(column).cloned()) else {
            continue;
        };
        let mut wrapper = Value::Object(Row::from_iter([(column.to_string(), current)]));
        mask_in_place(&mut wrapper, target.path.levels(), &target.strategy);
        if let Value::Object(mut map) = wrapper {
            if let Some(masked) = map.remove(column) {
                updates.insert(column.to_string(), masked);
            }
        }
    }
    updates
}
