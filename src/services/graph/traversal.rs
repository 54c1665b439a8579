// Traversal Planner
//
// Walks the dataset graph outward from the seed identity and produces the
// ordered execution plan. The same graph and seed always give the same plan.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde_json::Value;

use super::builder::{DatasetGraph, GraphEdge, GraphNode};
use crate::error::EngineError;
use crate::models::{
    CollectionAddress, ExecutionPlan, FieldPath, Identity, PlanEdge, PlannedNode, TraversalDetails,
};

/// Planning-time view of one collection, discarded once the plan is captured
#[derive(Debug, Default)]
struct TraversalNode {
    children: BTreeMap<CollectionAddress, Vec<PlanEdge>>,
    parents: BTreeMap<CollectionAddress, Vec<PlanEdge>>,
}

/// Builds execution plans against one immutable graph
pub struct TraversalPlanner<'a> {
    graph: &'a DatasetGraph,
}

impl<'a> TraversalPlanner<'a> {
    pub fn new(graph: &'a DatasetGraph) -> Self {
        Self { graph }
    }

    /// Plan a traversal seeded with the given identity values
    pub fn plan(&self, identity: &Identity) -> Result<ExecutionPlan, EngineError> {
        let edges = self.candidate_edges(identity);
        self.log_unresolved_ordering();

        let root = CollectionAddress::root();
        let mut remaining: BTreeSet<CollectionAddress> = self.graph.addresses().cloned().collect();
        let mut finished: HashSet<CollectionAddress> = HashSet::new();
        let mut discovered: HashSet<CollectionAddress> = HashSet::from([root.clone()]);
        let mut queue: VecDeque<CollectionAddress> = VecDeque::from([root]);
        let mut consumed = vec![false; edges.len()];
        let mut nodes: BTreeMap<CollectionAddress, TraversalNode> = BTreeMap::new();
        let mut order = Vec::with_capacity(remaining.len());

        while !queue.is_empty() {
            // First queued node whose ordering constraints hold
            let runnable = queue.iter().position(|address| {
                address.is_root()
                    || self
                        .graph
                        .node(address)
                        .map(|n| Self::can_run_given(n, &remaining))
                        .unwrap_or(false)
            });

            let Some(index) = runnable else {
                let blocked: Vec<String> = queue.iter().map(|a| a.to_string()).collect();
                return Err(EngineError::Traversal(format!(
                    "Ordering constraints can never be satisfied for: {}",
                    blocked.join(", ")
                )));
            };
            let Some(current) = queue.remove(index) else {
                break;
            };

            for (i, edge) in edges.iter().enumerate() {
                if consumed[i] {
                    continue;
                }
                let oriented = if edge.from.collection == current {
                    Some((&edge.from, &edge.to))
                } else if edge.bidirectional && edge.to.collection == current {
                    Some((&edge.to, &edge.from))
                } else {
                    None
                };
                let Some((near, far)) = oriented else {
                    continue;
                };

                consumed[i] = true;
                if far.collection == current || finished.contains(&far.collection) {
                    continue;
                }

                let plan_edge = PlanEdge {
                    from: near.clone(),
                    to: far.clone(),
                };
                nodes
                    .entry(current.clone())
                    .or_default()
                    .children
                    .entry(far.collection.clone())
                    .or_default()
                    .push(plan_edge.clone());
                nodes
                    .entry(far.collection.clone())
                    .or_default()
                    .parents
                    .entry(current.clone())
                    .or_default()
                    .push(plan_edge);

                if discovered.insert(far.collection.clone()) {
                    queue.push_back(far.collection.clone());
                }
            }

            remaining.remove(&current);
            finished.insert(current.clone());
            if !current.is_root() {
                tracing::debug!("Planned {} at position {}", current, order.len());
                order.push(current);
            }
        }

        if !remaining.is_empty() {
            let unreached: Vec<String> = remaining.iter().map(|a| a.to_string()).collect();
            return Err(EngineError::Traversal(format!(
                "Some collections were not reachable from the seed identity: {}",
                unreached.join(", ")
            )));
        }

        let mut planned = Vec::with_capacity(order.len());
        for (position, address) in order.into_iter().enumerate() {
            let graph_node = self
                .graph
                .node(&address)
                .ok_or_else(|| EngineError::Internal(format!("Planned unknown collection {}", address)))?;
            let traversal = nodes.remove(&address).unwrap_or_default();

            let mut incoming_edges: Vec<PlanEdge> = traversal.parents.values().flatten().cloned().collect();
            incoming_edges.sort();
            let mut outgoing_edges: Vec<PlanEdge> = traversal.children.values().flatten().cloned().collect();
            outgoing_edges.sort();

            planned.push(PlannedNode {
                collection: graph_node.collection.clone(),
                details: TraversalDetails {
                    position,
                    connection_key: graph_node.connection_key.clone(),
                    dataset_after: graph_node.dataset_after.clone(),
                    input_keys: traversal.parents.keys().cloned().collect(),
                    incoming_edges,
                    outgoing_edges,
                    downstream: traversal.children.keys().cloned().collect(),
                },
                address,
            });
        }

        tracing::info!(
            "Planned traversal of {} collections for identity kinds {:?}",
            planned.len(),
            identity.keys().collect::<Vec<_>>()
        );

        Ok(ExecutionPlan { nodes: planned })
    }

    /// A node may run once nothing it waits on is still remaining.
    ///
    /// `after` targets that are not part of the graph are never in `remaining`,
    /// so they count as satisfied.
    fn can_run_given(node: &GraphNode, remaining: &BTreeSet<CollectionAddress>) -> bool {
        let collections_done = node.collection.after.iter().all(|a| !remaining.contains(a));
        let datasets_done = node.dataset_after.is_empty()
            || remaining.iter().all(|r| !node.dataset_after.contains(&r.dataset));
        collections_done && datasets_done
    }

    /// Graph edges plus one directed edge from the root per matching identity field
    fn candidate_edges(&self, identity: &Identity) -> Vec<GraphEdge> {
        let root = CollectionAddress::root();
        let mut edges = Vec::new();
        for (kind, value) in identity {
            if matches!(value, Value::Null) {
                continue;
            }
            let targets = self.graph.identity_fields(kind);
            if targets.is_empty() {
                tracing::debug!("No field declares identity '{}'; ignoring it", kind);
            }
            for target in targets {
                edges.push(GraphEdge {
                    from: root.field(FieldPath::new([kind.as_str()])),
                    to: target,
                    bidirectional: false,
                });
            }
        }
        edges.extend(self.graph.edges().iter().cloned());
        edges
    }

    fn log_unresolved_ordering(&self) {
        let datasets = self.graph.datasets();
        for node in self.graph.nodes() {
            for target in &node.collection.after {
                if !self.graph.contains(target) {
                    tracing::warn!(
                        "Planning ambiguity: {} waits on {}, which is not part of this graph; treating it as satisfied",
                        node.address,
                        target
                    );
                }
            }
            for dataset in &node.dataset_after {
                if !datasets.contains(dataset.as_str()) {
                    tracing::warn!(
                        "Planning ambiguity: {} waits on dataset {}, which is not part of this graph; treating it as satisfied",
                        node.address,
                        dataset
                    );
                }
            }
        }
    }
}
