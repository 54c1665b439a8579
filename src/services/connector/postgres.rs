// PostgreSQL connector using pooled connections
use deadpool_postgres::Pool;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use url::Url;

use super::{column_inputs, masked_columns, quote_ident, Connector, ConnectorType, FetchOutcome, FetchRequest, MaskOutcome, MaskRequest};
use crate::error::{ConnectorError, ConnectorErrorKind, EngineError};
use crate::models::Row;

pub struct PostgresConnector {
    pool: Pool,
    timeout: Duration,
}

impl PostgresConnector {
    pub fn new(pool: Pool, connection_url: &str, timeout_secs: u64) -> Result<Self, EngineError> {
        let url = Url::parse(connection_url)
            .map_err(|e| EngineError::Validation(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(EngineError::Validation(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self {
            pool,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, ConnectorError> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_postgres::PoolError::Timeout(_) => {
                ConnectorError::timeout(format!("Timed out waiting for a pooled connection: {}", e))
            }
            other => ConnectorError::connection_reset(format!("Failed to get connection from pool: {}", other)),
        })
    }

    /// `SELECT .. WHERE "a"::text = ANY($1) OR "b"::text = ANY($2)`
    fn select_sql(table: &str, columns: &[&str], predicates: &[(&str, &[Value])]) -> String {
        let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let clauses: Vec<String> = predicates
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{}::text = ANY(${})", quote_ident(column), i + 1))
            .collect();
        format!(
            "SELECT {} FROM {} WHERE {}",
            columns.join(", "),
            quote_ident(table),
            clauses.join(" OR ")
        )
    }

    /// Column name -> declared SQL type, so masked values can be cast back
    async fn column_types(
        client: &deadpool_postgres::Object,
        table: &str,
    ) -> Result<HashMap<String, String>, ConnectorError> {
        let rows = client
            .query(
                "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = $1",
                &[&table],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Classify a driver error by SQLSTATE class
fn map_pg_error(e: tokio_postgres::Error) -> ConnectorError {
    let Some(db_error) = e.as_db_error() else {
        if e.is_closed() {
            return ConnectorError::connection_reset(e.to_string());
        }
        return ConnectorError::other(e.to_string());
    };
    let code = db_error.code().code();
    let message = format!("Code: {}, Message: {}", code, db_error.message());
    let kind = match code {
        "57014" => ConnectorErrorKind::Timeout,
        "40001" | "40P01" | "53300" => ConnectorErrorKind::ServerError,
        c if c.starts_with("08") || c.starts_with("57P") => ConnectorErrorKind::ConnectionReset,
        c if c.starts_with("28") => ConnectorErrorKind::Unauthorized,
        "42501" => ConnectorErrorKind::Forbidden,
        c if c.starts_with("42") => ConnectorErrorKind::InvalidConfig,
        _ => ConnectorErrorKind::BadRequest,
    };
    ConnectorError::new(kind, message)
}

fn row_to_json(row: &tokio_postgres::Row) -> Row {
    let mut record = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::INT2 => row.get::<_, Option<i16>>(idx).map(|v| json!(v)),
            Type::INT4 => row.get::<_, Option<i32>>(idx).map(|v| json!(v)),
            Type::INT8 => row.get::<_, Option<i64>>(idx).map(|v| json!(v)),
            Type::FLOAT4 => row.get::<_, Option<f32>>(idx).map(|v| json!(v)),
            Type::FLOAT8 => row.get::<_, Option<f64>>(idx).map(|v| json!(v)),
            Type::BOOL => row.get::<_, Option<bool>>(idx).map(|v| json!(v)),
            Type::TIMESTAMPTZ => row
                .get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .map(|v| json!(v.to_rfc3339())),
            _ => match row.try_get::<_, Option<String>>(idx) {
                Ok(v) => v.map(Value::String),
                Err(_) => Some(json!(format!("<{}>", column.type_().name()))),
            },
        };
        record.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    record
}

#[async_trait::async_trait]
impl Connector for PostgresConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Postgres
    }

    async fn fetch_rows(&self, request: &FetchRequest) -> Result<FetchOutcome, ConnectorError> {
        let collection = &request.node.collection;
        let predicates = column_inputs(&request.inputs, ConnectorType::Postgres)?;
        if predicates.is_empty() {
            return Ok(FetchOutcome::Empty);
        }

        let sql = Self::select_sql(&collection.name, &collection.top_level_field_names(), &predicates);
        let arrays: Vec<Vec<String>> = predicates
            .iter()
            .map(|(_, values)| values.iter().filter_map(text_of).collect())
            .collect();
        let params: Vec<&(dyn ToSql + Sync)> = arrays.iter().map(|a| a as &(dyn ToSql + Sync)).collect();

        tracing::debug!("Postgres fetch for {}: {}", request.node.address, sql);

        let client = self.client().await?;
        let rows = tokio::time::timeout(self.timeout, client.query(sql.as_str(), &params))
            .await
            .map_err(|_| ConnectorError::timeout(format!("Query timeout after {:?}", self.timeout)))?
            .map_err(map_pg_error)?;

        Ok(FetchOutcome::from_rows(rows.iter().map(row_to_json).collect()))
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

        let client = self.client().await?;
        let types = Self::column_types(&client, &collection.name).await?;

        let mut masked = 0u64;
        for row in &request.rows {
            let updates = masked_columns(row, &request.targets);
            if updates.is_empty() {
                continue;
            }

            let mut values: Vec<Option<String>> = Vec::new();
            let mut assignments = Vec::new();
            for (column, value) in &updates {
                values.push(text_of(value));
                let cast = types.get(column).map(String::as_str).unwrap_or("text");
                assignments.push(format!("{} = ${}::text::{}", quote_ident(column), values.len(), cast));
            }
            let mut conditions = Vec::new();
            for pk in &primary_keys {
                let Some(column) = pk.head() else { continue };
                values.push(row.get(column).and_then(text_of));
                conditions.push(format!("{}::text = ${}", quote_ident(column), values.len()));
            }

            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                quote_ident(&collection.name),
                assignments.join(", "),
                conditions.join(" AND ")
            );
            let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            masked += tokio::time::timeout(self.timeout, client.execute(sql.as_str(), &params))
                .await
                .map_err(|_| ConnectorError::timeout(format!("Update timeout after {:?}", self.timeout)))?
                .map_err(map_pg_error)?;
        }

        Ok(MaskOutcome::Masked(masked as usize))
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ConnectionPoolManager;
    use serde_json::json;

    #[test]
    fn test_select_sql_shape() {
        let email = [json!("a@example.com")];
        let ids = [json!(1), json!(2)];
        let predicates: Vec<(&str, &[Value])> = vec![("email", &email), ("id", &ids)];
        let sql = PostgresConnector::select_sql("customers", &["id", "email"], &predicates);
        assert_eq!(
            sql,
            "SELECT \"id\", \"email\" FROM \"customers\" WHERE \"email\"::text = ANY($1) OR \"id\"::text = ANY($2)"
        );
    }

    #[test]
    fn test_text_of() {
        assert_eq!(text_of(&json!(42)), Some("42".to_string()));
        assert_eq!(text_of(&json!("x")), Some("x".to_string()));
        assert_eq!(text_of(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_rejects_non_postgres_url() {
        let manager = ConnectionPoolManager::new();
        let pool = manager
            .get_or_create_pool("postgresql://user:pw@127.0.0.1:1/privacy")
            .await
            .unwrap();
        assert!(PostgresConnector::new(pool.clone(), "mysql://localhost/db", 5).is_err());
        assert!(PostgresConnector::new(pool, "postgresql://user:pw@127.0.0.1:1/privacy", 5).is_ok());
    }
}
