pub mod builder;
pub mod traversal;

pub use builder::{DatasetGraph, GraphEdge, GraphNode};
pub use traversal::TraversalPlanner;
