mod base;

pub use base::{EventBus, GraphEvent, NodeExecution, NodeExecutionStatus, RunId};
