use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::address::{CollectionAddress, FieldAddress};
use super::dataset::Collection;

/// A traversed edge, oriented from the parent field to the child field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanEdge {
    pub from: FieldAddress,
    pub to: FieldAddress,
}

/// Everything about a node's place in the plan, apart from its schema
///
/// This is the `traversal_details_json` column of a persisted task, so a
/// resumed execution never has to re-derive the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalDetails {
    pub position: usize,
    pub connection_key: String,
    #[serde(default)]
    pub dataset_after: BTreeSet<String>,
    /// Parent collections, sorted
    pub input_keys: Vec<CollectionAddress>,
    pub incoming_edges: Vec<PlanEdge>,
    pub outgoing_edges: Vec<PlanEdge>,
    /// Child collections, sorted
    pub downstream: Vec<CollectionAddress>,
}

/// One collection scheduled by the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedNode {
    pub address: CollectionAddress,
    pub collection: Collection,
    pub details: TraversalDetails,
}

impl PlannedNode {
    pub fn position(&self) -> usize {
        self.details.position
    }

    pub fn input_keys(&self) -> &[CollectionAddress] {
        &self.details.input_keys
    }

    pub fn connection_key(&self) -> &str {
        &self.details.connection_key
    }
}

/// Ordered schedule produced by traversal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub nodes: Vec<PlannedNode>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&PlannedNode> {
        self.nodes.iter().find(|n| &n.address == address)
    }

    pub fn addresses(&self) -> Vec<CollectionAddress> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }

    pub fn collections(&self) -> impl Iterator<Item = (&CollectionAddress, &Collection)> {
        self.nodes.iter().map(|n| (&n.address, &n.collection))
    }
}
