use crate::{NodeConfig, NodeError, NodeId, NodeType, ResponseTemplate, RunId, Value, VariablePool};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Execute the node body against the run's variable pool.
    ///
    /// Returning `Err` and returning a result with [`NodeRunStatus::Failed`]
    /// are equivalent.
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError>;

    /// Optional: validate configuration at graph build time
    fn validate_config(&self, _config: &NodeConfig) -> Result<(), NodeError> {
        Ok(())
    }

    /// Response nodes return the template whose pieces the engine streams
    /// to the client in order while upstream nodes are still running.
    fn streaming_template(&self, _config: &NodeConfig) -> Option<ResponseTemplate> {
        None
    }
}

/// A piece of a node output produced before the node finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// `[node_id, output]` the chunk belongs to
    pub selector: Vec<String>,
    pub chunk: String,
    pub is_final: bool,
}

/// Where a node sends its stream chunks; discards them when unset
#[derive(Clone, Default)]
pub struct ChunkSink(Option<Arc<dyn Fn(StreamChunk) + Send + Sync>>);

impl ChunkSink {
    pub fn new(send: impl Fn(StreamChunk) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(send)))
    }

    pub fn send(&self, chunk: StreamChunk) {
        if let Some(send) = &self.0 {
            send(chunk);
        }
    }
}

impl std::fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChunkSink").field(&self.0.is_some()).finish()
    }
}

/// Execution context passed to each node invocation
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    /// Id of the execution record this invocation reports under
    pub execution_id: Uuid,
    pub node_id: NodeId,
    pub config: Arc<NodeConfig>,
    /// Scope-local view of the pool; outputs are written by the engine
    pub variable_pool: VariablePool,
    /// Fired when the run is aborted
    pub cancellation: tokio_util::sync::CancellationToken,
    /// Zero for the first attempt, incremented per retry
    pub attempt: u32,
    pub chunks: ChunkSink,
}

impl NodeContext {
    /// Resolve a selector or fail with `MissingInput`
    pub fn require_variable<S: AsRef<str>>(&self, selector: &[S]) -> Result<Value, NodeError> {
        self.variable_pool.get(selector).ok_or_else(|| {
            let joined: Vec<&str> = selector.iter().map(|s| s.as_ref()).collect();
            NodeError::MissingInput(joined.join("."))
        })
    }

    /// Decode the node's typed settings from its config `data`
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> Result<T, NodeError> {
        self.config.decode_data().map_err(|e| {
            NodeError::Configuration(format!(
                "{} ({}): {}",
                self.node_id, self.config.node_type, e
            ))
        })
    }

    /// Stream part of an output before the node returns. The full value
    /// must still be reported in the run result.
    pub fn stream(&self, output: &str, chunk: impl Into<String>, is_final: bool) {
        self.chunks.send(StreamChunk {
            selector: vec![self.node_id.clone(), output.to_string()],
            chunk: chunk.into(),
            is_final,
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRunStatus {
    #[default]
    Succeeded,
    Failed,
}

/// Result returned by a node body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRunResult {
    pub status: NodeRunStatus,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub process_data: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub metadata: NodeRunMetadata,
    /// Branch chosen by a branch node; matched against edge labels
    pub edge_source_handle: Option<String>,
}

/// Usage and bookkeeping attached to a run result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRunMetadata {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

impl NodeRunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, Value>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn with_process_data(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.process_data.insert(name.into(), value.into());
        self
    }

    pub fn with_edge_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.edge_source_handle = Some(handle.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.metadata.total_tokens = tokens;
        self
    }

    /// A failed result, equivalent to returning `Err` from [`Node::run`]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NodeRunStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// What the engine does with a node run after normalising both error channels
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Success(NodeRunResult),
    Failure(NodeFailure),
}

#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub error: NodeError,
    /// Whatever the node reported before failing (inputs, process data)
    pub partial: NodeRunResult,
}

impl NodeOutcome {
    pub fn from_run(result: Result<NodeRunResult, NodeError>) -> Self {
        match result {
            Ok(run) if run.status == NodeRunStatus::Succeeded => NodeOutcome::Success(run),
            Ok(run) => NodeOutcome::Failure(NodeFailure {
                error: NodeError::Reported {
                    message: run.error.clone().unwrap_or_else(|| "node reported failure".to_string()),
                    error_type: run.error_type.clone(),
                },
                partial: run,
            }),
            Err(error) => NodeOutcome::Failure(NodeFailure {
                error,
                partial: NodeRunResult::default(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_status_and_error_normalise_the_same_way() {
        let reported = NodeOutcome::from_run(Ok(NodeRunResult::failed("boom")));
        let raised = NodeOutcome::from_run(Err(NodeError::ExecutionFailed("boom".to_string())));

        for outcome in [reported, raised] {
            match outcome {
                NodeOutcome::Failure(failure) => {
                    assert!(failure.error.is_retryable());
                    assert!(failure.error.to_string().contains("boom"));
                }
                NodeOutcome::Success(_) => panic!("expected failure"),
            }
        }
    }

    #[test]
    fn unset_sink_discards_chunks() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            ChunkSink::new(move |chunk| seen.lock().push(chunk))
        };
        sink.send(StreamChunk {
            selector: vec!["llm".to_string(), "text".to_string()],
            chunk: "hi".to_string(),
            is_final: false,
        });
        ChunkSink::default().send(StreamChunk {
            selector: vec!["llm".to_string(), "text".to_string()],
            chunk: "lost".to_string(),
            is_final: true,
        });
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].chunk, "hi");
    }

    #[test]
    fn builder_collects_outputs() {
        let result = NodeRunResult::new()
            .with_output("text", "hi")
            .with_edge_source_handle("true")
            .with_tokens(12);
        assert_eq!(result.outputs.get("text"), Some(&Value::from("hi")));
        assert_eq!(result.edge_source_handle.as_deref(), Some("true"));
        assert!(NodeOutcome::from_run(Ok(result)).is_success());
    }
}
