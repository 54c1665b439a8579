// Manual task connector
//
// Stands in for a backend that a person has to query by hand. Until the
// task is completed every call reports that the node is awaiting input.

use std::sync::Arc;

use super::{Connector, ConnectorType, FetchOutcome, FetchRequest, MaskOutcome, MaskRequest, TaskRef};
use crate::error::{ConnectorError, ConnectorErrorKind, EngineError};
use crate::models::{ActionType, ManualTask, ManualTaskStatus, PlannedNode, Row};
use crate::services::ManualTaskService;

pub struct ManualTaskConnector {
    service: Arc<ManualTaskService>,
}

impl ManualTaskConnector {
    pub fn new(service: Arc<ManualTaskService>) -> Self {
        Self { service }
    }

    async fn task(&self, request_id: &str, node: &PlannedNode, action: ActionType) -> Result<ManualTask, ConnectorError> {
        self.service
            .get_or_create(request_id, &node.address, action)
            .await
            .map_err(to_connector_error)
    }
}

fn to_connector_error(e: EngineError) -> ConnectorError {
    match e {
        EngineError::Connector(inner) => inner,
        EngineError::NotFound(msg) => ConnectorError::new(ConnectorErrorKind::NotFound, msg),
        other => ConnectorError::other(other.to_string()),
    }
}

fn task_ref(task: &ManualTask) -> TaskRef {
    TaskRef {
        task_id: task.id.clone(),
        collection: task.collection.clone(),
    }
}

#[async_trait::async_trait]
impl Connector for ManualTaskConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Manual
    }

    async fn fetch_rows(&self, request: &FetchRequest) -> Result<FetchOutcome, ConnectorError> {
        let task = self.task(&request.request_id, &request.node, ActionType::Access).await?;
        if task.status != ManualTaskStatus::Completed {
            tracing::info!(
                "Access for {} is waiting on manual task {}",
                request.node.address,
                task.id
            );
            return Ok(FetchOutcome::AwaitingExternalInput(task_ref(&task)));
        }

        let row: Row = task
            .submissions
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        if row.is_empty() {
            return Ok(FetchOutcome::Empty);
        }
        Ok(FetchOutcome::Ready(vec![row]))
    }

    async fn mask_rows(&self, request: &MaskRequest) -> Result<MaskOutcome, ConnectorError> {
        let task = self.task(&request.request_id, &request.node, ActionType::Erasure).await?;
        if task.status != ManualTaskStatus::Completed {
            tracing::info!(
                "Erasure for {} is waiting on manual task {}",
                request.node.address,
                task.id
            );
            return Ok(MaskOutcome::AwaitingExternalInput(task_ref(&task)));
        }
        Ok(MaskOutcome::Masked(request.rows.len()))
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn requires_primary_keys(&self) -> bool {
        false
    }
}
