use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::address::CollectionAddress;
use super::dataset::Collection;
use super::plan::{PlannedNode, TraversalDetails};
use super::policy::{ActionType, Policy};
use super::Row;
use crate::error::EngineError;

/// Seed identity supplied by the requester, e.g. `{"email": "a@example.com"}`
pub type Identity = BTreeMap<String, Value>;

/// Lifecycle of a privacy request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProcessing,
    RequiresInput,
    Complete,
    Partial,
    Error,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProcessing => "in_processing",
            RequestStatus::RequiresInput => "requires_input",
            RequestStatus::Complete => "complete",
            RequestStatus::Partial => "partial",
            RequestStatus::Error => "error",
            RequestStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "pending" => Ok(RequestStatus::Pending),
            "in_processing" => Ok(RequestStatus::InProcessing),
            "requires_input" => Ok(RequestStatus::RequiresInput),
            "complete" => Ok(RequestStatus::Complete),
            "partial" => Ok(RequestStatus::Partial),
            "error" => Ok(RequestStatus::Error),
            "canceled" => Ok(RequestStatus::Canceled),
            other => Err(EngineError::Serialization(format!("Unknown request status: {}", other))),
        }
    }
}

/// A request to locate or delete one person's data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyRequest {
    pub id: String,
    pub policy: Policy,
    pub identity: Identity,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PrivacyRequest {
    pub fn new(policy: Policy, identity: Identity) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            policy,
            identity,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Execution state of one persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Error,
    AwaitingInput,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
            TaskStatus::AwaitingInput => "awaiting_input",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "complete" => Ok(TaskStatus::Complete),
            "error" => Ok(TaskStatus::Error),
            "awaiting_input" => Ok(TaskStatus::AwaitingInput),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(EngineError::Serialization(format!("Unknown task status: {}", other))),
        }
    }

    /// Children may run once every parent is in one of these
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error | TaskStatus::Skipped)
    }
}

/// Durable record of one planned node's execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTask {
    pub id: String,
    pub request_id: String,
    pub collection_address: CollectionAddress,
    pub action_type: ActionType,
    pub collection: Collection,
    pub traversal: TraversalDetails,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Rows returned by the connector once access completes
    pub rows: Option<Vec<Row>>,
    pub rows_masked: Option<usize>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestTask {
    pub fn from_planned(request_id: &str, node: &PlannedNode, action_type: ActionType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            collection_address: node.address.clone(),
            action_type,
            collection: node.collection.clone(),
            traversal: node.details.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            rows: None,
            rows_masked: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the planned node this task was persisted from
    pub fn to_planned(&self) -> PlannedNode {
        PlannedNode {
            address: self.collection_address.clone(),
            collection: self.collection.clone(),
            details: self.traversal.clone(),
        }
    }
}
