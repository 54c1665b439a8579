pub mod connection_pool;
pub mod connector;
pub mod execution; // Scheduler, retry controller and task ledgers
pub mod graph; // Dataset graph and traversal planner
pub mod graph_cache;
pub mod manual_task_service;
pub mod request_service;
pub mod result_filter;

pub use connection_pool::*;
pub use connector::{ConnectionConfig, Connector, ConnectorRegistry, ConnectorType, FetchOutcome, MaskOutcome};
pub use graph::{DatasetGraph, TraversalPlanner};
pub use graph_cache::*;
pub use manual_task_service::*;
pub use request_service::*;
pub use result_filter::*;
