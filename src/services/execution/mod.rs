pub mod checkpoint;
pub mod executor;
pub mod ledger;
pub mod node;
pub mod retry;

pub use checkpoint::{persist_plan, resume_plan, CheckpointLedger};
pub use executor::{
    AwaitingNode, CancelFlag, ExecutionManifest, ExecutionOptions, ExecutionReport, FailedNode, GraphExecutor, NodeRef,
};
pub use ledger::{InMemoryLedger, NodeState, TaskLedger};
pub use node::{build_inputs, erasure_targets, ExecutionNode, NodeContext};
pub use retry::RetryPolicy;
