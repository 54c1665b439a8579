// HTTP connector for SaaS-style REST APIs
//
// Lookups are `GET {base}/{collection}?{field}={value}`, one call per input
// value. Erasure is `PATCH {base}/{collection}/{primary key}` with the masked
// fields as a JSON body.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Response};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use url::Url;

use super::{masked_columns, Connector, ConnectorType, FetchOutcome, FetchRequest, MaskOutcome, MaskRequest};
use crate::error::{ConnectorError, EngineError};
use crate::models::Row;

pub struct HttpConnector {
    base_url: String,
    client: Client,
}

impl HttpConnector {
    pub fn new(base_url: &str, headers: &BTreeMap<String, String>, timeout_secs: u64) -> Result<Self, EngineError> {
        let url = Url::parse(base_url).map_err(|e| EngineError::Validation(format!("Invalid HTTP URL: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(EngineError::Validation(
                "URL must use http:// or https:// scheme".to_string(),
            ));
        }

        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| EngineError::Validation(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Validation(format!("Invalid header value for '{}': {}", name, e)))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    /// Turn a non-success response into a classified connector error
    async fn check(response: Response) -> Result<Response, ConnectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        Err(ConnectorError::from_status(status.as_u16(), body, retry_after))
    }
}

/// `Retry-After` in delay-seconds form
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn map_reqwest_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::timeout(e.to_string())
    } else if e.is_connect() {
        ConnectorError::connection_reset(e.to_string())
    } else if let Some(status) = e.status() {
        ConnectorError::from_status(status.as_u16(), e.to_string(), None)
    } else {
        ConnectorError::other(e.to_string())
    }
}

/// Accept a bare array, a single object, or an envelope such as `{"data": [...]}`
pub(crate) fn rows_from_body(body: Value, collection: &str) -> Vec<Row> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(mut map) => {
            for key in [collection, "data", "results", "items"] {
                if let Some(inner @ Value::Array(_)) = map.remove(key) {
                    return rows_from_body(inner, collection);
                }
            }
            if map.is_empty() {
                Vec::new()
            } else {
                vec![map]
            }
        }
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Http
    }

    async fn fetch_rows(&self, request: &FetchRequest) -> Result<FetchOutcome, ConnectorError> {
        let collection = &request.node.collection.name;
        let endpoint = self.endpoint(collection);
        let mut rows = Vec::new();
        let mut seen = HashSet::new();

        for (path, values) in &request.inputs {
            let param = path.to_string();
            for value in values {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                tracing::debug!("HTTP fetch {} ?{}=...", endpoint, param);
                let response = self
                    .client
                    .get(&endpoint)
                    .query(&[(param.as_str(), value.as_str())])
                    .send()
                    .await
                    .map_err(map_reqwest_error)?;
                let body: Value = Self::check(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ConnectorError::other(format!("Failed to parse response: {}", e)))?;

                for row in rows_from_body(body, collection) {
                    // The same record can match several inputs
                    if seen.insert(Value::Object(row.clone()).to_string()) {
                        rows.push(row);
                    }
                }
            }
        }

        Ok(FetchOutcome::from_rows(rows))
    }

    async fn mask_rows(&self, request: &MaskRequest) -> Result<MaskOutcome, ConnectorError> {
        let collection = &request.node.collection;
        let Some(pk) = collection.primary_keys().into_iter().next() else {
            return Err(ConnectorError::invalid_config(format!(
                "Collection {} has no primary key",
                request.node.address
            )));
        };

        let mut masked = 0;
        for row in &request.rows {
            let Some(id) = pk.retrieve_from(&Value::Object(row.clone())).into_iter().next() else {
                tracing::warn!("Row in {} has no value for primary key {}", request.node.address, pk);
                continue;
            };
            let updates = masked_columns(row, &request.targets);
            if updates.is_empty() {
                continue;
            }
            let id = match id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            let url = format!("{}/{}", self.endpoint(&collection.name), id);
            let response = self
                .client
                .patch(&url)
                .json(&updates)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            Self::check(response).await?;
            masked += 1;
        }

        Ok(MaskOutcome::Masked(masked))
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        match response.status().as_u16() {
            // A bare base URL often has no route of its own
            404 | 405 => Ok(()),
            _ => Self::check(response).await.map(|_| ()),
        }
    }
}
