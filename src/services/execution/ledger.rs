use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{ActionType, CollectionAddress, Row, TaskStatus};
use crate::services::connector::TaskRef;

/// Execution state of one node in one phase
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub status: TaskStatus,
    pub attempts: u32,
    pub rows: Option<Vec<Row>>,
    pub rows_masked: Option<usize>,
    pub error: Option<String>,
    /// Manual task the node is suspended on
    pub awaiting: Option<TaskRef>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            rows: None,
            rows_masked: None,
            error: None,
            awaiting: None,
        }
    }

    pub fn running(&self) -> Self {
        Self {
            status: TaskStatus::Running,
            attempts: self.attempts + 1,
            error: None,
            awaiting: None,
            ..self.clone()
        }
    }

    pub fn complete(attempts: u32, rows: Vec<Row>) -> Self {
        Self {
            status: TaskStatus::Complete,
            attempts,
            rows: Some(rows),
            ..Self::pending()
        }
    }

    pub fn masked(attempts: u32, rows_masked: usize) -> Self {
        Self {
            status: TaskStatus::Complete,
            attempts,
            rows_masked: Some(rows_masked),
            ..Self::pending()
        }
    }

    pub fn skipped(attempts: u32) -> Self {
        Self {
            status: TaskStatus::Skipped,
            attempts,
            ..Self::pending()
        }
    }

    pub fn failed(attempts: u32, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            attempts,
            error: Some(message.into()),
            ..Self::pending()
        }
    }

    pub fn awaiting(attempts: u32, task: TaskRef) -> Self {
        Self {
            status: TaskStatus::AwaitingInput,
            attempts,
            awaiting: Some(task),
            ..Self::pending()
        }
    }
}

/// Where the executor keeps node state between transitions.
///
/// The in-memory ledger lives for one run; the checkpoint ledger writes
/// through to `request_tasks` so a run can be resumed elsewhere.
#[async_trait::async_trait]
pub trait TaskLedger: Send + Sync {
    /// Known state of the phase's nodes. Nodes missing from the map are pending.
    async fn load(&self, action: ActionType) -> Result<BTreeMap<CollectionAddress, NodeState>>;

    async fn record(&self, action: ActionType, address: &CollectionAddress, state: &NodeState) -> Result<()>;

    /// Checked between scheduling rounds. `true` when the run was canceled
    /// from outside this process.
    async fn should_stop(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Ledger for the legacy single-process mode
#[derive(Default)]
pub struct InMemoryLedger {
    states: Mutex<HashMap<(ActionType, CollectionAddress), NodeState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskLedger for InMemoryLedger {
    async fn load(&self, action: ActionType) -> Result<BTreeMap<CollectionAddress, NodeState>> {
        let states = self.states.lock().await;
        Ok(states
            .iter()
            .filter(|((a, _), _)| *a == action)
            .map(|((_, address), state)| (address.clone(), state.clone()))
            .collect())
    }

    async fn record(&self, action: ActionType, address: &CollectionAddress, state: &NodeState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert((action, address.clone()), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ledger_separates_phases() {
        let ledger = InMemoryLedger::new();
        let address = CollectionAddress::new("crm", "customers");
        let running = NodeState::pending().running();
        assert_eq!(running.attempts, 1);

        ledger.record(ActionType::Access, &address, &running).await.unwrap();
        ledger
            .record(ActionType::Access, &address, &NodeState::complete(1, vec![]))
            .await
            .unwrap();

        let access = ledger.load(ActionType::Access).await.unwrap();
        assert_eq!(access[&address].status, TaskStatus::Complete);
        assert!(ledger.load(ActionType::Erasure).await.unwrap().is_empty());
    }
}
