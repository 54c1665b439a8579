pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

pub use config::EngineConfig;
pub use error::{ConnectorError, ConnectorErrorKind, EngineError, Result};
pub use models::*;
pub use services::*;
pub use storage::SqliteStorage;
pub use validation::*;
