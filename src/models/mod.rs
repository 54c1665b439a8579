pub mod address;
pub mod dataset;
pub mod manual_task;
pub mod plan;
pub mod policy;
pub mod request;

pub use address::*;
pub use dataset::*;
pub use manual_task::*;
pub use plan::*;
pub use policy::*;
pub use request::*;

/// One record returned by a connector
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows per collection, e.g. the raw output of an access run
pub type CollectionRows = std::collections::BTreeMap<CollectionAddress, Vec<Row>>;
