// Checkpointed task graph
//
// Durable wrapper over the planner's output. Every planned node becomes one
// `request_tasks` row per action, carrying its schema snapshot and traversal
// details, so another process can resume without planning again.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::ledger::{NodeState, TaskLedger};
use crate::error::{EngineError, Result};
use crate::models::{
    ActionType, CollectionAddress, ExecutionPlan, PrivacyRequest, RequestStatus, RequestTask, TaskStatus,
};
use crate::storage::SqliteStorage;

/// Write one task per planned node (and per erasure node, if the policy erases)
pub async fn persist_plan(
    storage: &SqliteStorage,
    request: &PrivacyRequest,
    plan: &ExecutionPlan,
) -> Result<Vec<RequestTask>> {
    let mut tasks: Vec<RequestTask> = plan
        .nodes
        .iter()
        .map(|node| RequestTask::from_planned(&request.id, node, ActionType::Access))
        .collect();
    if request.policy.has_erasure_rules() {
        tasks.extend(
            plan.nodes
                .iter()
                .map(|node| RequestTask::from_planned(&request.id, node, ActionType::Erasure)),
        );
    }
    storage.insert_tasks(&tasks).await?;
    tracing::info!(
        "Persisted {} tasks for request {} ({} planned collections)",
        tasks.len(),
        request.id,
        plan.len()
    );
    Ok(tasks)
}

/// Rebuild the plan from the stored access tasks, in plan order
pub async fn resume_plan(storage: &SqliteStorage, request_id: &str) -> Result<ExecutionPlan> {
    let tasks = storage.get_tasks(request_id, ActionType::Access).await?;
    if tasks.is_empty() {
        return Err(EngineError::NotFound(format!("No persisted tasks for request {}", request_id)));
    }
    Ok(ExecutionPlan {
        nodes: tasks.iter().map(RequestTask::to_planned).collect(),
    })
}

fn state_of(task: &RequestTask) -> NodeState {
    NodeState {
        status: task.status,
        attempts: task.attempts,
        rows: task.rows.clone(),
        rows_masked: task.rows_masked,
        error: task.error_message.clone(),
        awaiting: None,
    }
}

/// Ledger writing every transition through to `request_tasks`
pub struct CheckpointLedger {
    storage: Arc<SqliteStorage>,
    request_id: String,
    max_task_attempts: u32,
    tasks: Mutex<HashMap<(ActionType, CollectionAddress), RequestTask>>,
    /// Access nodes put back to pending by the last access load
    rerun: Mutex<BTreeSet<CollectionAddress>>,
    lock_owner: Option<String>,
}

impl CheckpointLedger {
    pub fn new(storage: Arc<SqliteStorage>, request_id: &str, max_task_attempts: u32) -> Self {
        Self {
            storage,
            request_id: request_id.to_string(),
            max_task_attempts,
            tasks: Mutex::new(HashMap::new()),
            rerun: Mutex::new(BTreeSet::new()),
            lock_owner: None,
        }
    }

    /// Keep `owner`'s execution lock fresh while the run goes on
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    /// Whether a stored task has to run (again) on resume
    fn needs_reset(&self, task: &RequestTask) -> bool {
        match task.status {
            TaskStatus::Running | TaskStatus::AwaitingInput => true,
            TaskStatus::Error => task.attempts < self.max_task_attempts,
            _ => false,
        }
    }

    /// Access tasks to put back to pending: the resettable ones, plus every
    /// skipped task downstream of them, since a skip there may only mean a
    /// parent had no rows yet.
    fn access_resets(&self, stored: &[RequestTask]) -> BTreeSet<CollectionAddress> {
        let mut children: HashMap<&CollectionAddress, Vec<&CollectionAddress>> = HashMap::new();
        for task in stored {
            for child in &task.traversal.downstream {
                children.entry(&task.collection_address).or_default().push(child);
            }
            if let Some(condition) = &task.collection.run_condition {
                let sources = condition.collections();
                for source in stored.iter().filter(|t| sources.contains(&t.collection_address)) {
                    children
                        .entry(&source.collection_address)
                        .or_default()
                        .push(&task.collection_address);
                }
            }
        }
        let skipped: BTreeSet<&CollectionAddress> = stored
            .iter()
            .filter(|t| t.status == TaskStatus::Skipped)
            .map(|t| &t.collection_address)
            .collect();

        let mut resets: BTreeSet<CollectionAddress> = stored
            .iter()
            .filter(|t| self.needs_reset(t))
            .map(|t| t.collection_address.clone())
            .collect();
        let mut queue: VecDeque<&CollectionAddress> = stored
            .iter()
            .filter(|t| resets.contains(&t.collection_address))
            .map(|t| &t.collection_address)
            .collect();
        let mut seen: BTreeSet<&CollectionAddress> = queue.iter().copied().collect();
        while let Some(address) = queue.pop_front() {
            for &child in children.get(&address).into_iter().flatten() {
                if seen.insert(child) {
                    if skipped.contains(&child) {
                        resets.insert(child.clone());
                    }
                    queue.push_back(child);
                }
            }
        }
        resets
    }
}

#[async_trait::async_trait]
impl TaskLedger for CheckpointLedger {
    async fn load(&self, action: ActionType) -> Result<BTreeMap<CollectionAddress, NodeState>> {
        let stored = self.storage.get_tasks(&self.request_id, action).await?;
        let resets = match action {
            ActionType::Access => {
                let resets = self.access_resets(&stored);
                *self.rerun.lock().await = resets.clone();
                resets
            }
            // Erasure follows the access nodes that run again
            ActionType::Erasure => {
                let rerun = self.rerun.lock().await;
                stored
                    .iter()
                    .filter(|t| {
                        self.needs_reset(t)
                            || (rerun.contains(&t.collection_address) && t.status != TaskStatus::Complete)
                    })
                    .map(|t| t.collection_address.clone())
                    .collect()
            }
        };

        let mut tasks = self.tasks.lock().await;
        let mut states = BTreeMap::new();
        for mut task in stored {
            if resets.contains(&task.collection_address) {
                tracing::info!(
                    "Resetting {} task for {} from {} to pending (attempt {})",
                    action,
                    task.collection_address,
                    task.status.as_str(),
                    task.attempts
                );
                task.status = TaskStatus::Pending;
                task.rows = None;
                task.rows_masked = None;
                task.error_message = None;
                self.storage.update_task(&task).await?;
            }
            states.insert(task.collection_address.clone(), state_of(&task));
            tasks.insert((action, task.collection_address.clone()), task);
        }
        Ok(states)
    }

    async fn record(&self, action: ActionType, address: &CollectionAddress, state: &NodeState) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(&(action, address.clone())).ok_or_else(|| {
            EngineError::NotFound(format!(
                "No {} task for {} in request {}",
                action, address, self.request_id
            ))
        })?;
        task.status = state.status;
        task.attempts = state.attempts;
        task.rows = state.rows.clone();
        task.rows_masked = state.rows_masked;
        task.error_message = state.error.clone();
        self.storage.update_task(task).await
    }

    async fn should_stop(&self) -> Result<bool> {
        if let Some(owner) = &self.lock_owner {
            if !self.storage.refresh_lock(&self.request_id, owner).await? {
                tracing::warn!("Execution lock for request {} was taken over; stopping", self.request_id);
                return Err(EngineError::AlreadyExecuting(self.request_id.clone()));
            }
        }
        let status = self
            .storage
            .get_request(&self.request_id)
            .await?
            .map(|r| r.status);
        Ok(status == Some(RequestStatus::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, MaskingStrategy, Policy, Rule};
    use crate::services::graph::builder::tests::crm_and_billing;
    use crate::services::graph::{DatasetGraph, TraversalPlanner};
    use serde_json::json;

    fn identity() -> Identity {
        Identity::from([("email".to_string(), json!("a@example.com"))])
    }

    async fn persisted(policy: Policy) -> (Arc<SqliteStorage>, PrivacyRequest, ExecutionPlan) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let graph = DatasetGraph::build(&crm_and_billing()).unwrap();
        let plan = TraversalPlanner::new(&graph).plan(&identity()).unwrap();
        let request = PrivacyRequest::new(policy, identity());
        storage.save_request(&request).await.unwrap();
        persist_plan(&storage, &request, &plan).await.unwrap();
        (storage, request, plan)
    }

    #[tokio::test]
    async fn test_resume_yields_identical_plan() {
        let (storage, request, plan) = persisted(Policy::new("p", vec![Rule::access("all", ["user"])])).await;
        let resumed = resume_plan(&storage, &request.id).await.unwrap();
        assert_eq!(resumed, plan);
        assert_eq!(
            serde_json::to_string(&resumed).unwrap(),
            serde_json::to_string(&plan).unwrap()
        );
        assert!(storage.get_tasks(&request.id, ActionType::Erasure).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_erasure_policy_persists_both_phases() {
        let (storage, request, plan) = persisted(Policy::new(
            "p",
            vec![Rule::erasure("erase", ["user"], MaskingStrategy::NullRewrite)],
        ))
        .await;
        let erasure = storage.get_tasks(&request.id, ActionType::Erasure).await.unwrap();
        assert_eq!(erasure.len(), plan.len());
    }

    #[tokio::test]
    async fn test_resume_plan_for_unknown_request() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(matches!(resume_plan(&storage, "missing").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_resets_interrupted_and_retryable_tasks() {
        let (storage, request, plan) = persisted(Policy::new("p", vec![Rule::access("all", ["user"])])).await;
        let customers = plan.nodes[0].address.clone();
        let invoices = plan.nodes[1].address.clone();

        let ledger = CheckpointLedger::new(Arc::clone(&storage), &request.id, 2);
        ledger.load(ActionType::Access).await.unwrap();
        ledger
            .record(ActionType::Access, &customers, &NodeState::pending().running())
            .await
            .unwrap();
        ledger
            .record(ActionType::Access, &invoices, &NodeState::failed(1, "boom"))
            .await
            .unwrap();

        // A fresh process sees the crash leftovers
        let resumed = CheckpointLedger::new(Arc::clone(&storage), &request.id, 2);
        let states = resumed.load(ActionType::Access).await.unwrap();
        assert_eq!(states[&customers].status, TaskStatus::Pending);
        assert_eq!(states[&customers].attempts, 1);
        assert_eq!(states[&invoices].status, TaskStatus::Pending);

        // Out of attempts: the error sticks
        resumed
            .record(ActionType::Access, &invoices, &NodeState::failed(2, "boom"))
            .await
            .unwrap();
        let states = CheckpointLedger::new(Arc::clone(&storage), &request.id, 2)
            .load(ActionType::Access)
            .await
            .unwrap();
        assert_eq!(states[&invoices].status, TaskStatus::Error);
        assert_eq!(states[&invoices].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_load_resets_skipped_descendants_of_retried_node() {
        let (storage, request, plan) = persisted(Policy::new(
            "p",
            vec![Rule::erasure("erase", ["user"], MaskingStrategy::NullRewrite)],
        ))
        .await;
        let customers = plan.nodes[0].address.clone();
        let invoices = plan.nodes[1].address.clone();

        let ledger = CheckpointLedger::new(Arc::clone(&storage), &request.id, 3);
        ledger.load(ActionType::Access).await.unwrap();
        ledger.load(ActionType::Erasure).await.unwrap();
        ledger
            .record(ActionType::Access, &customers, &NodeState::failed(1, "unauthorized"))
            .await
            .unwrap();
        ledger
            .record(ActionType::Access, &invoices, &NodeState::skipped(0))
            .await
            .unwrap();
        ledger
            .record(ActionType::Erasure, &invoices, &NodeState::skipped(0))
            .await
            .unwrap();

        let resumed = CheckpointLedger::new(Arc::clone(&storage), &request.id, 3);
        let access = resumed.load(ActionType::Access).await.unwrap();
        assert_eq!(access[&customers].status, TaskStatus::Pending);
        assert_eq!(access[&invoices].status, TaskStatus::Pending);
        let erasure = resumed.load(ActionType::Erasure).await.unwrap();
        assert_eq!(erasure[&invoices].status, TaskStatus::Pending);

        let stored = storage.get_tasks(&request.id, ActionType::Access).await.unwrap();
        assert!(stored.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_load_keeps_skips_with_no_retried_ancestor() {
        let (storage, request, plan) = persisted(Policy::new("p", vec![Rule::access("all", ["user"])])).await;
        let customers = plan.nodes[0].address.clone();
        let invoices = plan.nodes[1].address.clone();

        let ledger = CheckpointLedger::new(Arc::clone(&storage), &request.id, 3);
        ledger.load(ActionType::Access).await.unwrap();
        ledger
            .record(ActionType::Access, &customers, &NodeState::complete(1, Vec::new()))
            .await
            .unwrap();
        ledger
            .record(ActionType::Access, &invoices, &NodeState::skipped(0))
            .await
            .unwrap();

        let states = CheckpointLedger::new(Arc::clone(&storage), &request.id, 3)
            .load(ActionType::Access)
            .await
            .unwrap();
        assert_eq!(states[&customers].status, TaskStatus::Complete);
        assert_eq!(states[&invoices].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_record_unknown_node_fails() {
        let (storage, request, _) = persisted(Policy::new("p", vec![Rule::access("all", ["user"])])).await;
        let ledger = CheckpointLedger::new(storage, &request.id, 3);
        ledger.load(ActionType::Access).await.unwrap();
        let result = ledger
            .record(ActionType::Access, &CollectionAddress::new("x", "y"), &NodeState::skipped(0))
            .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
