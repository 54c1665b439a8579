// Graph Executor
//
// Runs an execution plan through a bounded worker pool. Both execution modes
// go through this scheduler and only differ in the ledger that records node
// state, so they launch nodes in the same order.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ledger::{NodeState, TaskLedger};
use super::node::{ExecutionNode, NodeContext};
use super::retry::RetryPolicy;
use crate::error::Result;
use crate::models::{
    ActionType, CollectionAddress, CollectionRows, ExecutionPlan, PlannedNode, PrivacyRequest, RequestStatus,
    Row, TaskStatus,
};
use crate::services::connector::{ConnectorRegistry, TaskRef};
use crate::services::result_filter::FieldCategoryIndex;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Upper bound on nodes in flight at once
    pub max_concurrency: usize,
    /// How many times a failed task may run before its error is final
    pub max_task_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().clamp(2, 32),
            max_task_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// Operator-raised stop signal; running nodes finish, nothing new launches
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub collection: CollectionAddress,
    pub action_type: ActionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedNode {
    pub collection: CollectionAddress,
    pub action_type: ActionType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingNode {
    pub collection: CollectionAddress,
    pub action_type: ActionType,
    pub task: Option<TaskRef>,
}

/// Where every planned node ended up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    pub completed: Vec<NodeRef>,
    pub failed: Vec<FailedNode>,
    pub skipped: Vec<NodeRef>,
    pub awaiting_input: Vec<AwaitingNode>,
    /// Not started, e.g. blocked behind a suspended node or by cancellation
    pub pending: Vec<NodeRef>,
}

/// Final node states of one run
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub access: BTreeMap<CollectionAddress, NodeState>,
    pub erasure: BTreeMap<CollectionAddress, NodeState>,
    pub canceled: bool,
}

impl ExecutionReport {
    fn all_states(&self) -> impl Iterator<Item = (ActionType, &CollectionAddress, &NodeState)> {
        self.access
            .iter()
            .map(|(a, s)| (ActionType::Access, a, s))
            .chain(self.erasure.iter().map(|(a, s)| (ActionType::Erasure, a, s)))
    }

    pub fn status(&self) -> RequestStatus {
        if self.canceled {
            return RequestStatus::Canceled;
        }
        let states: Vec<&NodeState> = self.all_states().map(|(_, _, s)| s).collect();
        if states.iter().any(|s| !s.status.is_terminal()) {
            return RequestStatus::RequiresInput;
        }
        let failed = states.iter().filter(|s| s.status == TaskStatus::Error).count();
        let succeeded = states.iter().filter(|s| s.status == TaskStatus::Complete).count();
        if failed == 0 {
            RequestStatus::Complete
        } else if succeeded == 0 {
            RequestStatus::Error
        } else {
            RequestStatus::Partial
        }
    }

    /// Rows of every collection whose access completed
    pub fn access_results(&self) -> CollectionRows {
        self.access
            .iter()
            .filter(|(_, s)| s.status == TaskStatus::Complete)
            .map(|(a, s)| (a.clone(), s.rows.clone().unwrap_or_default()))
            .collect()
    }

    pub fn rows_masked(&self) -> BTreeMap<CollectionAddress, usize> {
        self.erasure
            .iter()
            .filter_map(|(a, s)| s.rows_masked.map(|n| (a.clone(), n)))
            .collect()
    }

    pub fn manifest(&self) -> ExecutionManifest {
        let mut manifest = ExecutionManifest::default();
        for (action_type, address, state) in self.all_states() {
            let node = NodeRef {
                collection: address.clone(),
                action_type,
            };
            match state.status {
                TaskStatus::Complete => manifest.completed.push(node),
                TaskStatus::Skipped => manifest.skipped.push(node),
                TaskStatus::Error => manifest.failed.push(FailedNode {
                    collection: node.collection,
                    action_type,
                    message: state.error.clone().unwrap_or_default(),
                }),
                TaskStatus::AwaitingInput => manifest.awaiting_input.push(AwaitingNode {
                    collection: node.collection,
                    action_type,
                    task: state.awaiting.clone(),
                }),
                TaskStatus::Pending | TaskStatus::Running => manifest.pending.push(node),
            }
        }
        manifest
    }
}

pub struct GraphExecutor {
    registry: ConnectorRegistry,
    options: ExecutionOptions,
}

impl GraphExecutor {
    pub fn new(registry: ConnectorRegistry, options: ExecutionOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run the access phase and, once it has settled, the erasure phase
    pub async fn execute(
        &self,
        request: &PrivacyRequest,
        plan: &ExecutionPlan,
        ledger: &dyn TaskLedger,
        cancel: &CancelFlag,
    ) -> Result<ExecutionReport> {
        let categories = FieldCategoryIndex::from_plan(plan);
        let ctx = NodeContext {
            request_id: &request.id,
            identity: &request.identity,
            policy: &request.policy,
            registry: &self.registry,
            retry: &self.options.retry,
            categories: &categories,
        };

        tracing::info!(
            "Executing request {} over {} collections (max concurrency {})",
            request.id,
            plan.len(),
            self.options.max_concurrency
        );
        let access = self.run_phase(&ctx, plan, ActionType::Access, ledger, cancel, None).await?;

        let mut erasure = BTreeMap::new();
        if request.policy.has_erasure_rules() {
            let settled = access.values().all(|s| s.status.is_terminal());
            if settled && !cancel.is_canceled() {
                erasure = self
                    .run_phase(&ctx, plan, ActionType::Erasure, ledger, cancel, Some(&access))
                    .await?;
            } else {
                tracing::info!("Erasure for request {} waits until access has finished", request.id);
                erasure = Self::initial_states(plan, ledger, ActionType::Erasure).await?;
            }
        }

        let report = ExecutionReport {
            access,
            erasure,
            canceled: cancel.is_canceled(),
        };
        tracing::info!("Request {} finished with status {}", request.id, report.status().as_str());
        Ok(report)
    }

    async fn initial_states(
        plan: &ExecutionPlan,
        ledger: &dyn TaskLedger,
        action: ActionType,
    ) -> Result<BTreeMap<CollectionAddress, NodeState>> {
        let mut states = ledger.load(action).await?;
        for node in &plan.nodes {
            states.entry(node.address.clone()).or_insert_with(NodeState::pending);
        }
        Ok(states)
    }

    async fn run_phase(
        &self,
        ctx: &NodeContext<'_>,
        plan: &ExecutionPlan,
        action: ActionType,
        ledger: &dyn TaskLedger,
        cancel: &CancelFlag,
        access: Option<&BTreeMap<CollectionAddress, NodeState>>,
    ) -> Result<BTreeMap<CollectionAddress, NodeState>> {
        let mut states = Self::initial_states(plan, ledger, action).await?;
        let limit = self.options.max_concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !cancel.is_canceled() && ledger.should_stop().await? {
                tracing::info!("Request {} was canceled elsewhere; launching no more nodes", ctx.request_id);
                cancel.cancel();
            }
            if cancel.is_canceled() {
                if !in_flight.is_empty() {
                    tracing::info!(
                        "Request {} canceled; waiting for {} running nodes",
                        ctx.request_id,
                        in_flight.len()
                    );
                }
            } else {
                for node in &plan.nodes {
                    if in_flight.len() >= limit {
                        break;
                    }
                    let Some(current) = states.get(&node.address) else {
                        continue;
                    };
                    if current.status != TaskStatus::Pending || !Self::is_ready(action, node, plan, &states) {
                        continue;
                    }

                    let running = current.running();
                    ledger.record(action, &node.address, &running).await?;
                    tracing::debug!("Starting {} for {} (attempt {})", action, node.address, running.attempts);

                    let input = match action {
                        ActionType::Access => NodeInput::Parents(Self::parent_rows(node, &states)),
                        ActionType::Erasure => NodeInput::Rows(
                            access
                                .and_then(|a| a.get(&node.address))
                                .filter(|s| s.status == TaskStatus::Complete)
                                .and_then(|s| s.rows.clone())
                                .unwrap_or_default(),
                        ),
                    };
                    in_flight.push(Self::run_node(ctx, node, input, running.attempts));
                    states.insert(node.address.clone(), running);
                }
            }

            let Some((address, state)) = in_flight.next().await else {
                break;
            };
            ledger.record(action, &address, &state).await?;
            states.insert(address, state);
        }

        if !cancel.is_canceled() {
            Self::fail_unschedulable(action, &mut states, ledger).await?;
        }
        Ok(states)
    }

    async fn run_node(ctx: &NodeContext<'_>, node: &PlannedNode, input: NodeInput, attempts: u32) -> (CollectionAddress, NodeState) {
        let runtime = ExecutionNode::new(ctx, node);
        let state = match input {
            NodeInput::Parents(parents) => runtime.access(&parents, attempts).await,
            NodeInput::Rows(rows) => runtime.erasure(rows, attempts).await,
        };
        (node.address.clone(), state)
    }

    /// Every dependency of `node` for this phase has reached a terminal state.
    ///
    /// Ordering targets outside the plan count as satisfied.
    fn is_ready(
        action: ActionType,
        node: &PlannedNode,
        plan: &ExecutionPlan,
        states: &BTreeMap<CollectionAddress, NodeState>,
    ) -> bool {
        let done = |address: &CollectionAddress| states.get(address).map(|s| s.status.is_terminal()).unwrap_or(true);

        match action {
            ActionType::Access => {
                let conditions_ready = node
                    .collection
                    .run_condition
                    .as_ref()
                    .map(|c| c.collections().iter().all(done))
                    .unwrap_or(true);
                node.input_keys().iter().filter(|a| !a.is_root()).all(done)
                    && node.collection.after.iter().all(done)
                    && conditions_ready
                    && plan
                        .nodes
                        .iter()
                        .filter(|n| node.details.dataset_after.contains(&n.address.dataset))
                        .all(|n| done(&n.address))
            }
            ActionType::Erasure => node.collection.erase_after.iter().all(done),
        }
    }

    /// Rows of the node's finished parents, plus any collections its run condition reads
    fn parent_rows(node: &PlannedNode, states: &BTreeMap<CollectionAddress, NodeState>) -> CollectionRows {
        let mut sources: Vec<&CollectionAddress> = node.input_keys().iter().filter(|a| !a.is_root()).collect();
        let condition_sources = node
            .collection
            .run_condition
            .as_ref()
            .map(|c| c.collections())
            .unwrap_or_default();
        sources.extend(condition_sources.iter());

        sources
            .into_iter()
            .filter_map(|address| {
                let state = states.get(address)?;
                if state.status != TaskStatus::Complete {
                    return None;
                }
                Some((address.clone(), state.rows.clone().unwrap_or_default()))
            })
            .collect()
    }

    /// Nodes still pending with nothing suspended upstream can never start,
    /// e.g. an `erase_after` cycle. Record them as failed instead of waiting forever.
    async fn fail_unschedulable(
        action: ActionType,
        states: &mut BTreeMap<CollectionAddress, NodeState>,
        ledger: &dyn TaskLedger,
    ) -> Result<()> {
        if states.values().any(|s| s.status == TaskStatus::AwaitingInput) {
            return Ok(());
        }
        let stuck: Vec<CollectionAddress> = states
            .iter()
            .filter(|(_, s)| s.status == TaskStatus::Pending)
            .map(|(a, _)| a.clone())
            .collect();
        for address in stuck {
            let message = format!("{} for {} can never be scheduled: ordering constraints are circular", action, address);
            tracing::error!("{}", message);
            let state = NodeState::failed(states.get(&address).map(|s| s.attempts).unwrap_or(0), message);
            ledger.record(action, &address, &state).await?;
            states.insert(address, state);
        }
        Ok(())
    }
}

enum NodeInput {
    Parents(CollectionRows),
    Rows(Vec<Row>),
}
