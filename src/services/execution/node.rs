// Execution node
//
// The unit of work bound to one planned collection. Turns parent output into
// typed connector inputs, calls the connector through the retry controller and
// reports the resulting node state. Calling either operation twice is safe.

use serde_json::Value;
use std::collections::BTreeMap;

use super::ledger::NodeState;
use super::retry::RetryPolicy;
use crate::models::{ActionType, CollectionRows, FieldPath, Identity, PlannedNode, Policy, Row};
use crate::services::connector::{
    ConnectorRegistry, FetchOutcome, FetchRequest, MaskOutcome, MaskRequest, MaskTarget,
};
use crate::services::result_filter::FieldCategoryIndex;

/// Request-wide inputs shared by every node of one run
pub struct NodeContext<'a> {
    pub request_id: &'a str,
    pub identity: &'a Identity,
    pub policy: &'a Policy,
    pub registry: &'a ConnectorRegistry,
    pub retry: &'a RetryPolicy,
    pub categories: &'a FieldCategoryIndex,
}

/// Query inputs for `node`: values flowing along each incoming edge, coerced
/// to the target field's type, arrays flattened and duplicates removed.
/// Fields that receive nothing are left out.
pub fn build_inputs(node: &PlannedNode, parents: &CollectionRows, identity: &Identity) -> BTreeMap<FieldPath, Vec<Value>> {
    let mut inputs: BTreeMap<FieldPath, Vec<Value>> = BTreeMap::new();

    for edge in &node.details.incoming_edges {
        let target = &edge.to.path;
        let data_type = node.collection.field(target).map(|f| f.data_type()).unwrap_or_default();

        let raw: Vec<Value> = if edge.from.collection.is_root() {
            match edge.from.path.head().and_then(|kind| identity.get(kind)) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => Vec::new(),
            }
        } else {
            parents
                .get(&edge.from.collection)
                .map(|rows| {
                    rows.iter()
                        .flat_map(|row| edge.from.path.retrieve_from(&Value::Object(row.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let values = inputs.entry(target.clone()).or_default();
        for value in raw {
            if let Some(coerced) = data_type.coerce(&value) {
                if !values.contains(&coerced) {
                    values.push(coerced);
                }
            }
        }
    }

    inputs.retain(|_, values| !values.is_empty());
    inputs
}

/// Fields of the node selected by the policy's erasure rules, with the
/// strategy of the first rule selecting each. Primary keys are never masked.
pub fn erasure_targets(node: &PlannedNode, policy: &Policy, categories: &FieldCategoryIndex) -> Vec<MaskTarget> {
    let primary_keys = node.collection.primary_keys();
    let mut targets: Vec<MaskTarget> = Vec::new();

    for rule in policy.rules_for(ActionType::Erasure) {
        let Some(strategy) = &rule.masking_strategy else {
            continue;
        };
        for path in categories.matching_paths(&node.address, &rule.targets) {
            if primary_keys.iter().any(|pk| pk.is_prefix_of(&path) || path.is_prefix_of(pk)) {
                tracing::debug!("Not masking {} in {}: overlaps a primary key", path, node.address);
                continue;
            }
            if targets.iter().any(|t| t.path.is_prefix_of(&path) || path.is_prefix_of(&t.path)) {
                continue;
            }
            targets.push(MaskTarget {
                path,
                strategy: strategy.clone(),
            });
        }
    }
    targets
}

pub struct ExecutionNode<'a> {
    ctx: &'a NodeContext<'a>,
    node: &'a PlannedNode,
}

impl<'a> ExecutionNode<'a> {
    pub fn new(ctx: &'a NodeContext<'a>, node: &'a PlannedNode) -> Self {
        Self { ctx, node }
    }

    /// Fetch this collection's rows given the output of its finished parents
    pub async fn access(&self, parents: &CollectionRows, attempts: u32) -> NodeState {
        let address = &self.node.address;

        if let Some(condition) = &self.node.collection.run_condition {
            if !condition.evaluate(parents) {
                tracing::info!("Skipping {}: run condition not met", address);
                return NodeState::skipped(attempts);
            }
        }

        let inputs = build_inputs(self.node, parents, self.ctx.identity);
        if inputs.is_empty() {
            tracing::info!("Skipping {}: no input values from upstream", address);
            return NodeState::skipped(attempts);
        }

        let connector = match self.ctx.registry.get(self.node.connection_key()) {
            Ok(connector) => connector,
            Err(e) => {
                tracing::error!("Access for {} failed: {}", address, e);
                return NodeState::failed(attempts, e.to_string());
            }
        };

        let request = FetchRequest {
            request_id: self.ctx.request_id.to_string(),
            node: self.node.clone(),
            inputs,
        };
        let label = format!("access {}", address);
        match self.ctx.retry.run(&label, || connector.fetch_rows(&request)).await {
            Ok(FetchOutcome::Ready(rows)) => {
                tracing::info!("Access for {} returned {} rows", address, rows.len());
                NodeState::complete(attempts, rows)
            }
            Ok(FetchOutcome::Empty) => {
                tracing::info!("Access for {} found no rows", address);
                NodeState::complete(attempts, Vec::new())
            }
            Ok(FetchOutcome::AwaitingExternalInput(task)) => {
                tracing::info!("Access for {} is awaiting input on task {}", address, task.task_id);
                NodeState::awaiting(attempts, task)
            }
            Err(e) => {
                tracing::error!("Access for {} failed: {}", address, e);
                NodeState::failed(attempts, e.to_string())
            }
        }
    }

    /// Mask the policy's target fields in rows previously fetched for this collection
    pub async fn erasure(&self, rows: Vec<Row>, attempts: u32) -> NodeState {
        let address = &self.node.address;
        if rows.is_empty() {
            tracing::debug!("Skipping erasure for {}: no rows were found", address);
            return NodeState::skipped(attempts);
        }

        let targets = erasure_targets(self.node, self.ctx.policy, self.ctx.categories);
        if targets.is_empty() {
            tracing::debug!("Skipping erasure for {}: no fields match the erasure rules", address);
            return NodeState::skipped(attempts);
        }

        let connector = match self.ctx.registry.get(self.node.connection_key()) {
            Ok(connector) => connector,
            Err(e) => {
                tracing::error!("Erasure for {} failed: {}", address, e);
                return NodeState::failed(attempts, e.to_string());
            }
        };
        if connector.requires_primary_keys() && self.node.collection.primary_keys().is_empty() {
            tracing::warn!("Skipping erasure for {}: collection has no primary key", address);
            return NodeState::skipped(attempts);
        }

        let request = MaskRequest {
            request_id: self.ctx.request_id.to_string(),
            node: self.node.clone(),
            rows,
            targets,
        };
        let label = format!("erasure {}", address);
        match self.ctx.retry.run(&label, || connector.mask_rows(&request)).await {
            Ok(MaskOutcome::Masked(count)) => {
                tracing::info!("Erasure for {} masked {} rows", address, count);
                NodeState::masked(attempts, count)
            }
            Ok(MaskOutcome::AwaitingExternalInput(task)) => {
                tracing::info!("Erasure for {} is awaiting input on task {}", address, task.task_id);
                NodeState::awaiting(attempts, task)
            }
            Err(e) => {
                tracing::error!("Erasure for {} failed: {}", address, e);
                NodeState::failed(attempts, e.to_string())
            }
        }
    }
}
