use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Build error: {0}")]
    Build(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Traversal error: {0}")]
    Traversal(String),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request {0} is already executing")]
    AlreadyExecuting(String),

    #[error("Request {0} was canceled")]
    Canceled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the connector error if this failure came from a connector call
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            EngineError::Connector(e) => Some(e),
            _ => None,
        }
    }
}

/// Convert anyhow::Error to EngineError
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to EngineError
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Failure classes a connector call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    ConnectionReset,
    Unauthorized,
    Forbidden,
    InvalidConfig,
    NotFound,
    BadRequest,
    Other,
}

impl ConnectorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorErrorKind::Timeout => "timeout",
            ConnectorErrorKind::RateLimited => "rate_limited",
            ConnectorErrorKind::ServerError => "server_error",
            ConnectorErrorKind::ConnectionReset => "connection_reset",
            ConnectorErrorKind::Unauthorized => "unauthorized",
            ConnectorErrorKind::Forbidden => "forbidden",
            ConnectorErrorKind::InvalidConfig => "invalid_config",
            ConnectorErrorKind::NotFound => "not_found",
            ConnectorErrorKind::BadRequest => "bad_request",
            ConnectorErrorKind::Other => "other",
        }
    }
}

/// Error raised by a connector, carrying the hints the retry controller needs.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}{}: {message}", .kind.as_str(), status_suffix(.status))]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Server-supplied wait before the next attempt (e.g. `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl ConnectorError {
    pub fn new(kind: ConnectorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::ConnectionReset, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::InvalidConfig, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            status: Some(429),
            ..Self::new(ConnectorErrorKind::RateLimited, message)
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ConnectorErrorKind::Other, message)
    }

    /// Map an HTTP status code onto a connector error kind
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let kind = match status {
            408 => ConnectorErrorKind::Timeout,
            429 => ConnectorErrorKind::RateLimited,
            401 => ConnectorErrorKind::Unauthorized,
            403 => ConnectorErrorKind::Forbidden,
            404 => ConnectorErrorKind::NotFound,
            400 | 422 => ConnectorErrorKind::BadRequest,
            500..=599 => ConnectorErrorKind::ServerError,
            _ => ConnectorErrorKind::Other,
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
            retry_after,
        }
    }

    /// Transient failures are retried; everything else propagates immediately
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ConnectorErrorKind::Timeout
                | ConnectorErrorKind::RateLimited
                | ConnectorErrorKind::ServerError
                | ConnectorErrorKind::ConnectionReset
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ConnectorError::from_status(429, "slow down", None).is_transient());
        assert!(ConnectorError::from_status(503, "unavailable", None).is_transient());
        assert!(ConnectorError::from_status(408, "timeout", None).is_transient());
        assert!(!ConnectorError::from_status(401, "bad token", None).is_transient());
        assert!(!ConnectorError::from_status(404, "gone", None).is_transient());
        assert!(!ConnectorError::from_status(400, "bad", None).is_transient());
    }

    #[test]
    fn test_connector_error_display() {
        let err = ConnectorError::rate_limited("too many requests", Some(Duration::from_secs(5)));
        let msg = err.to_string();
        assert!(msg.contains("rate_limited"));
        assert!(msg.contains("429"));
        assert!(msg.contains("too many requests"));

        assert_eq!(
            ConnectorError::from_status(401, "bad token", None).to_string(),
            "unauthorized (401): bad token"
        );
        assert_eq!(
            ConnectorError::invalid_config("missing host").to_string(),
            "invalid_config: missing host"
        );
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(ConnectorError::other("x"));
        assert_eq!(boxed.to_string(), "other: x");
    }

    #[test]
    fn test_engine_error_wraps_connector_error() {
        let err: EngineError = ConnectorError::invalid_config("missing host").into();
        let inner = err.as_connector_error().unwrap();
        assert_eq!(inner.kind, ConnectorErrorKind::InvalidConfig);
        assert!(!inner.is_transient());
    }

    #[test]
    fn test_from_rusqlite_error() {
        let err: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
