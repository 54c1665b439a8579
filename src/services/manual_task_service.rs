// Manual Task Service
//
// Owns the human-in-the-loop tasks that stand in for a connector. Configs
// and tasks live in the checkpoint store so a suspended request survives
// restarts while it waits for someone to fill the form in.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::models::{ActionType, CollectionAddress, ManualTask, ManualTaskConfig, ManualTaskField};
use crate::storage::SqliteStorage;

pub struct ManualTaskService {
    storage: Arc<SqliteStorage>,
}

impl ManualTaskService {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// Define (or redefine) the form for a manual collection
    pub async fn save_config(
        &self,
        collection: &CollectionAddress,
        fields: Vec<ManualTaskField>,
    ) -> Result<ManualTaskConfig> {
        if fields.is_empty() {
            return Err(EngineError::Validation(format!(
                "Manual task config for {} has no fields",
                collection
            )));
        }
        let config = self.storage.save_manual_task_config(collection, &fields).await?;
        tracing::info!("Saved manual task config for {} (version {})", collection, config.version);
        Ok(config)
    }

    pub async fn get_config(&self, collection: &CollectionAddress) -> Result<ManualTaskConfig> {
        self.storage
            .get_manual_task_config(collection)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Manual task config for {}", collection)))
    }

    pub async fn get(&self, task_id: &str) -> Result<ManualTask> {
        self.storage
            .get_manual_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Manual task {}", task_id)))
    }

    /// The task for one request, collection and action, created on first use
    pub async fn get_or_create(
        &self,
        request_id: &str,
        collection: &CollectionAddress,
        action_type: ActionType,
    ) -> Result<ManualTask> {
        if let Some(task) = self.storage.find_manual_task(request_id, collection, action_type).await? {
            return Ok(task);
        }
        let task = ManualTask::new(request_id, collection.clone(), action_type);
        self.storage.save_manual_task(&task).await?;
        tracing::info!(
            "Created manual {} task {} for {} (request {})",
            action_type,
            task.id,
            collection,
            request_id
        );
        Ok(task)
    }

    pub async fn submit(&self, task_id: &str, key: &str, value: Value) -> Result<ManualTask> {
        let mut task = self.get(task_id).await?;
        let config = self.get_config(&task.collection).await?;
        task.submit(&config, key, value)?;
        self.storage.save_manual_task(&task).await?;
        tracing::debug!("Manual task {} received field '{}'", task_id, key);
        Ok(task)
    }

    /// Complete against the collection's current config
    pub async fn complete(&self, task_id: &str) -> Result<ManualTask> {
        let mut task = self.get(task_id).await?;
        let config = self.get_config(&task.collection).await?;
        task.complete(&config)?;
        self.storage.save_manual_task(&task).await?;
        tracing::info!("Manual task {} for {} completed", task_id, task.collection);
        Ok(task)
    }

    pub async fn revert(&self, task_id: &str) -> Result<ManualTask> {
        let mut task = self.get(task_id).await?;
        task.revert()?;
        self.storage.save_manual_task(&task).await?;
        tracing::warn!("Manual task {} for {} reverted to pending", task_id, task.collection);
        Ok(task)
    }
}
