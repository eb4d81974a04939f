//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: values and the variable pool, graph configuration,
//! the node contract, response templates, graph events and the command
//! channel.

pub mod commands;
pub mod condition;
mod error;
pub mod events;
mod node;
mod value;
pub mod template;
pub mod variable_pool;
mod workflow;

pub use commands::{Command, CommandChannel, CommandSender, CommandTransport, TransportError};
pub use error::{FlowError, NodeError, VariableError};
pub use events::*;
pub use node::{
    ChunkSink, Node, NodeContext, NodeFailure, NodeOutcome, NodeRunMetadata, NodeRunResult,
    NodeRunStatus, StreamChunk,
};
pub use template::{ResponseTemplate, TemplateSegment};
pub use value::{FileValue, Value};
pub use variable_pool::{PoolSnapshot, SystemVariables, VariablePool};
pub use workflow::{
    EdgeConfig, ErrorStrategy, ExecutionType, GraphConfig, NodeConfig, NodeId, NodeType,
    RetryConfig, WorkflowConfig, WorkflowId, DEFAULT_SOURCE_HANDLE, FAIL_BRANCH_HANDLE,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
