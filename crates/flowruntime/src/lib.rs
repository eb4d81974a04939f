//! Workflow execution runtime
//!
//! This crate builds executable graphs from workflow configurations and runs
//! them: readiness tracking over edge states, a bounded worker pool, the
//! coordinator loop with loop and iteration scopes, ordered response
//! streaming, pause/resume snapshots and the layers observing a run.

pub mod config;
mod coordinator;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graph;
pub mod layers;
pub mod readiness;
mod registry;
pub mod response;
mod runtime;
pub mod scope;
pub mod state;
pub mod tracker;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{GraphEngine, GraphRun};
pub use error::EngineError;
pub use execution::{ExecutionStatus, GraphExecution};
pub use graph::{Graph, GraphValidationError};
pub use layers::{Layer, LayerContext};
pub use readiness::{EdgeState, EdgeStateTracker, ReadinessChecker};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use response::ResponseStreamState;
pub use runtime::{run_outputs, FlowRuntime, RuntimeConfig};
pub use state::{GraphExecutionState, RuntimeState, SnapshotError};
pub use tracker::ExecutionTracker;
pub use worker::{Backpressure, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerStats};
