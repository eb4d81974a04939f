use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure raised by a node body.
///
/// Returning `Err(NodeError)` and returning a `NodeRunResult` with a failed
/// status are treated the same way by the worker pool.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Variable(#[from] VariableError),

    /// A node returned a result whose status is `Failed`
    #[error("{message}")]
    Reported {
        message: String,
        error_type: Option<String>,
    },
}

impl NodeError {
    /// Whether a retry policy may re-run the node after this error.
    ///
    /// Configuration and input problems fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::ExecutionFailed(_) | NodeError::Timeout { .. } | NodeError::Reported { .. }
        )
    }

    /// Short machine readable kind, surfaced as `error_type` in node outputs
    pub fn error_type(&self) -> &str {
        match self {
            NodeError::MissingInput(_) => "MissingInput",
            NodeError::InvalidInputType { .. } => "InvalidInputType",
            NodeError::Configuration(_) => "Configuration",
            NodeError::ExecutionFailed(_) => "ExecutionFailed",
            NodeError::InitializationFailed(_) => "InitializationFailed",
            NodeError::Timeout { .. } => "Timeout",
            NodeError::Cancelled => "Cancelled",
            NodeError::Variable(_) => "Variable",
            NodeError::Reported { error_type, .. } => {
                error_type.as_deref().unwrap_or("NodeRunFailed")
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableError {
    #[error("Invalid selector {0:?}: expected [node_id, variable_name]")]
    InvalidSelector(Vec<String>),

    #[error("Variable {0:?} is already defined")]
    AlreadyDefined(Vec<String>),

    #[error("Variable {0:?} not found")]
    NotFound(Vec<String>),

    #[error("Variable {0:?} is read-only in this scope")]
    ReadOnly(Vec<String>),
}
