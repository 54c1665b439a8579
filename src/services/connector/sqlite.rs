// SQLite connector
//
// Serves collections stored as tables of one SQLite database. Object and
// array fields are stored as JSON text and decoded on the way out.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{column_inputs, masked_columns, quote_ident, Connector, ConnectorType, FetchOutcome, FetchRequest, MaskOutcome, MaskRequest};
use crate::error::{ConnectorError, ConnectorErrorKind, EngineError};
use crate::models::{Collection, FieldCapability, Row};

pub struct SqliteConnector {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnector {
    /// Open (or create) a database file. Accepts `sqlite:` and `sqlite://` prefixes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let raw = path.as_ref().to_string_lossy();
        let clean = raw.trim_start_matches("sqlite:").trim_start_matches("//");
        let conn = Connection::open(clean)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run raw SQL, e.g. to create and seed tables
    pub async fn execute_batch(&self, sql: &str) -> Result<(), ConnectorError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql).map_err(map_sqlite_error)
    }

    fn select_sql(collection: &Collection, predicates: &[(&str, &[Value])]) -> String {
        let columns: Vec<String> = collection
            .top_level_field_names()
            .into_iter()
            .map(quote_ident)
            .collect();
        let clauses: Vec<String> = predicates
            .iter()
            .map(|(column, values)| {
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", quote_ident(column), placeholders)
            })
            .collect();
        format!(
            "SELECT {} FROM {} WHERE {}",
            columns.join(", "),
            quote_ident(&collection.name),
            clauses.join(" OR ")
        )
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> ConnectorError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                ConnectorError::new(ConnectorErrorKind::Timeout, e.to_string())
            }
            rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::NotADatabase => {
                ConnectorError::invalid_config(e.to_string())
            }
            _ => ConnectorError::new(ConnectorErrorKind::BadRequest, e.to_string()),
        },
        _ => ConnectorError::other(e.to_string()),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: SqlValue, decode_json: bool) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => {
            if decode_json {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        SqlValue::Blob(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

#[async_trait::async_trait]
impl Connector for SqliteConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Sqlite
    }

    async fn fetch_rows(&self, request: &FetchRequest) -> Result<FetchOutcome, ConnectorError> {
        let collection = &request.node.collection;
        let predicates = column_inputs(&request.inputs, ConnectorType::Sqlite)?;
        if predicates.is_empty() {
            return Ok(FetchOutcome::Empty);
        }

        let sql = Self::select_sql(collection, &predicates);
        let params: Vec<SqlValue> = predicates
            .iter()
            .flat_map(|(_, values)| values.iter().map(to_sql_value))
            .collect();
        let json_columns: HashSet<&str> = collection
            .fields
            .iter()
            .filter(|f| f.has(FieldCapability::IsObject) || f.has(FieldCapability::IsArray))
            .map(|f| f.name.as_str())
            .collect();

        tracing::debug!("SQLite fetch for {}: {}", request.node.address, sql);

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(map_sqlite_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut record = Row::new();
            for (idx, name) in names.iter().enumerate() {
                let value: SqlValue = row.get(idx).map_err(map_sqlite_error)?;
                record.insert(name.clone(), from_sql_value(value, json_columns.contains(name.as_str())));
            }
            out.push(record);
        }

        Ok(FetchOutcome::from_rows(out))
    }

    async fn mask_rows(&self, request: &MaskRequest) -> Result<MaskOutcome, ConnectorError> {
        let collection = &request.node.collection;
        let primary_keys = collection.primary_keys();
        if primary_keys.is_empty() {
            return Err(ConnectorError::invalid_config(format!(
                "Collection {} has no primary key",
                request.node.address
            )));
        }

        let conn = self.conn.lock().await;
        let mut masked = 0;
        for row in &request.rows {
            let updates = masked_columns(row, &request.targets);
            if updates.is_empty() {
                continue;
            }

            let mut params: Vec<SqlValue> = Vec::new();
            let assignments: Vec<String> = updates
                .iter()
                .map(|(column, value)| {
                    params.push(to_sql_value(value));
                    format!("{} = ?", quote_ident(column))
                })
                .collect();

            let mut conditions = Vec::new();
            for pk in &primary_keys {
                let Some(column) = pk.head() else { continue };
                let value = row.get(column).cloned().unwrap_or(Value::Null);
                params.push(to_sql_value(&value));
                conditions.push(format!("{} = ?", quote_ident(column)));
            }

            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(&collection.name),
                assignments.join(", "),
                conditions.join(" AND ")
            );
            let changed = conn
                .execute(&sql, rusqlite::params_from_iter(params.iter()))
                .map_err(map_sqlite_error)?;
            masked += changed;
        }

        tracing::debug!("SQLite masked {} rows in {}", masked, request.node.address);
        Ok(MaskOutcome::Masked(masked))
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(())).map_err(map_sqlite_error)
    }
}
