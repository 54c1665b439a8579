// Dataset Graph Builder
//
// Merges dataset declarations into one graph of collections, connected by
// edges derived from field references.

use std::collections::{BTreeSet, HashMap};

use crate::error::EngineError;
use crate::models::{Collection, CollectionAddress, Dataset, EdgeDirection, FieldAddress, FieldCapability};
use crate::validation::DatasetValidator;

/// A collection participating in the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub address: CollectionAddress,
    pub connection_key: String,
    /// `after` set of the owning dataset
    pub dataset_after: BTreeSet<String>,
    pub collection: Collection,
}

/// Field-level dependency between two collections
///
/// Directed edges flow `from -> to`. Bidirectional edges are stored with the
/// smaller address first so the same reference declared from either side
/// collapses into one edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphEdge {
    pub from: FieldAddress,
    pub to: FieldAddress,
    pub bidirectional: bool,
}

impl GraphEdge {
    fn directed(from: FieldAddress, to: FieldAddress) -> Self {
        Self {
            from,
            to,
            bidirectional: false,
        }
    }

    fn bidirectional(a: FieldAddress, b: FieldAddress) -> Self {
        let (from, to) = if a <= b { (a, b) } else { (b, a) };
        Self {
            from,
            to,
            bidirectional: true,
        }
    }
}

/// Immutable merged graph, shared across requests against the same schema
#[derive(Debug, Clone, Default)]
pub struct DatasetGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<CollectionAddress, usize>,
    edges: Vec<GraphEdge>,
}

impl DatasetGraph {
    /// Build the graph, failing on malformed declarations or dangling references
    pub fn build(datasets: &[Dataset]) -> Result<Self, EngineError> {
        DatasetValidator::validate_all(datasets)?;

        let mut graph = DatasetGraph::default();
        let mut skipped = BTreeSet::new();

        for dataset in datasets {
            for collection in &dataset.collections {
                let address = CollectionAddress::new(&dataset.name, &collection.name);
                if collection.skip_processing {
                    tracing::debug!("Skipping collection {} (skip_processing)", address);
                    skipped.insert(address);
                    continue;
                }
                graph.index.insert(address.clone(), graph.nodes.len());
                graph.nodes.push(GraphNode {
                    address,
                    connection_key: dataset.connection_key().to_string(),
                    dataset_after: dataset.after.clone(),
                    collection: collection.clone(),
                });
            }
        }

        let mut edges = BTreeSet::new();
        for node in &graph.nodes {
            for (path, reference) in node.collection.references() {
                let source = node.address.field(path.clone());
                let target = reference.target().ok_or_else(|| {
                    EngineError::Build(format!("Malformed reference on {}: '{}'", source, reference.field))
                })?;

                if skipped.contains(&target.collection) {
                    tracing::debug!("Dropping reference {} -> {} to skipped collection", source, target);
                    continue;
                }

                let target_node = graph.node(&target.collection).ok_or_else(|| {
                    EngineError::Build(format!(
                        "Reference on {} names unknown collection {}",
                        source, target.collection
                    ))
                })?;
                if target_node.collection.field(&target.path).is_none() {
                    return Err(EngineError::Build(format!(
                        "Reference on {} names unknown field {}",
                        source, target
                    )));
                }

                let edge = match reference.direction {
                    Some(EdgeDirection::From) => GraphEdge::directed(target, source),
                    Some(EdgeDirection::To) => GraphEdge::directed(source, target),
                    None => GraphEdge::bidirectional(source, target),
                };
                edges.insert(edge);
            }
        }
        graph.edges = edges.into_iter().collect();

        tracing::info!(
            "Built dataset graph: {} collections, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );

        Ok(graph)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&GraphNode> {
        self.index.get(address).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, address: &CollectionAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &CollectionAddress> {
        self.nodes.iter().map(|n| &n.address)
    }

    /// Fields bound to the given identity kind, in node order
    pub fn identity_fields(&self, identity: &str) -> Vec<FieldAddress> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for (path, field) in node.collection.field_paths() {
                if field.has(FieldCapability::HasIdentity) && field.identity.as_deref() == Some(identity) {
                    out.push(node.address.field(path));
                }
            }
        }
        out
    }

    /// Datasets present in the graph
    pub fn datasets(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.address.dataset.as_str()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DataType, Field};

    pub(crate) fn collection(name: &str, fields: Vec<Field>) -> Collection {
        Collection {
            name: name.to_string(),
            fields,
            after: BTreeSet::new(),
            erase_after: BTreeSet::new(),
            data_categories: vec![],
            skip_processing: false,
            run_condition: None,
        }
    }

    pub(crate) fn dataset(name: &str, collections: Vec<Collection>) -> Dataset {
        Dataset {
            name: name.to_string(),
            description: None,
            connection_key: None,
            after: BTreeSet::new(),
            collections,
        }
    }

    /// `crm.customers` and `billing.invoices` linked by email
    pub(crate) fn crm_and_billing() -> Vec<Dataset> {
        vec![
            dataset(
                "crm",
                vec![collection(
                    "customers",
                    vec![
                        Field::leaf("id", DataType::Integer).with_primary_key(),
                        Field::leaf("email", DataType::String)
                            .with_identity("email")
                            .with_categories(["user.contact.email"]),
                        Field::leaf("name", DataType::String).with_categories(["user.name"]),
                    ],
                )],
            ),
            dataset(
                "billing",
                vec![collection(
                    "invoices",
                    vec![
                        Field::leaf("id", DataType::Integer).with_primary_key(),
                        Field::leaf("customer_email", DataType::String).with_reference(
                            "crm",
                            "customers.email",
                            Some(EdgeDirection::From),
                        ),
                        Field::leaf("amount", DataType::Float).with_categories(["user.financial"]),
                    ],
                )],
            ),
        ]
    }

    #[test]
    fn test_build_creates_directed_edge() {
        let graph = DatasetGraph::build(&crm_and_billing()).unwrap();
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.edges().len(), 1);
        let edge = &graph.edges()[0];
        assert_eq!(edge.from.to_string(), "crm.customers.email");
        assert_eq!(edge.to.to_string(), "billing.invoices.customer_email");
        assert!(!edge.bidirectional);
        assert_eq!(graph.identity_fields("email").len(), 1);
    }

    #[test]
    fn test_dangling_reference_is_build_error() {
        let mut datasets = crm_and_billing();
        datasets[1].collections[0].fields[1] = Field::leaf("customer_email", DataType::String).with_reference(
            "crm",
            "clients.email",
            None,
        );
        assert!(matches!(DatasetGraph::build(&datasets), Err(EngineError::Build(_))));

        let mut datasets = crm_and_billing();
        datasets[1].collections[0].fields[1] = Field::leaf("customer_email", DataType::String).with_reference(
            "crm",
            "customers.mail",
            None,
        );
        assert!(matches!(DatasetGraph::build(&datasets), Err(EngineError::Build(_))));
    }

    #[test]
    fn test_bidirectional_references_collapse() {
        let datasets = vec![
            dataset(
                "a",
                vec![collection(
                    "x",
                    vec![Field::leaf("id", DataType::String).with_reference("b", "y.x_id", None)],
                )],
            ),
            dataset(
                "b",
                vec![collection(
                    "y",
                    vec![Field::leaf("x_id", DataType::String).with_reference("a", "x.id", None)],
                )],
            ),
        ];
        let graph = DatasetGraph::build(&datasets).unwrap();
        assert_eq!(graph.edges().len(), 1);
        assert!(graph.edges()[0].bidirectional);
    }

    #[test]
    fn test_skip_processing_excluded() {
        let mut datasets = crm_and_billing();
        datasets[1].collections[0].skip_processing = true;
        let graph = DatasetGraph::build(&datasets).unwrap();
        assert_eq!(graph.nodes().len(), 1);
        assert!(graph.edges().is_empty());
        assert!(!graph.contains(&CollectionAddress::new("billing", "invoices")));
    }
}
