use crate::execution::InvalidTransition;
use crate::graph::GraphValidationError;
use crate::state::SnapshotError;
use crate::worker::WorkerPoolError;
use flowcore::{NodeId, VariableError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphValidationError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Run exceeded the time limit of {seconds}s")]
    RunTimeout { seconds: u64 },

    #[error("Run exceeded the limit of {max_steps} node runs")]
    ExecutionLimit { max_steps: u64 },

    #[error("Loop {node_id} did not finish within {max_iterations} iterations")]
    MaxIterationExceeded {
        node_id: NodeId,
        max_iterations: usize,
    },

    #[error("Branch node {0} did not select a branch")]
    MissingBranch(NodeId),

    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] WorkerPoolError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Run aborted: {}", .0.as_deref().unwrap_or("no reason given"))]
    RunAborted(Option<String>),

    #[error("Run failed: {error}")]
    RunFailed {
        error: String,
        node_id: Option<NodeId>,
    },

    #[error("Run paused")]
    RunPaused { snapshot: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Run ended without a terminal event")]
    Incomplete,
}
