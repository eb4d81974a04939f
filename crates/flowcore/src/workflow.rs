use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type WorkflowId = String;
pub type NodeId = String;

/// Branch label carried by edges that do not leave a branch node
pub const DEFAULT_SOURCE_HANDLE: &str = "source";
/// Branch label followed by `continue-on-error` nodes when they fail
pub const FAIL_BRANCH_HANDLE: &str = "fail-branch";

/// Complete workflow definition: graph plus the variables a run is seeded with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub graph: GraphConfig,
    /// Plain JSON values seeded under `env`
    #[serde(default)]
    pub environment_variables: serde_json::Map<String, serde_json::Value>,
    /// Initial conversation variables seeded under `conversation`
    #[serde(default)]
    pub conversation_variables: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: GraphConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            graph,
            environment_variables: serde_json::Map::new(),
            conversation_variables: serde_json::Map::new(),
        }
    }

    pub fn environment(&self) -> BTreeMap<String, Value> {
        to_values(&self.environment_variables)
    }

    pub fn conversation(&self) -> BTreeMap<String, Value> {
        to_values(&self.conversation_variables)
    }
}

fn to_values(map: &serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
        .collect()
}

/// Declarative node and edge lists a graph is built from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
    /// Explicit entry point; otherwise the start node is used
    #[serde(default)]
    pub root_node_id: Option<NodeId>,
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeConfig) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.connect_branch(source, DEFAULT_SOURCE_HANDLE, target);
    }

    pub fn connect_branch(
        &mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
    ) {
        self.edges.push(EdgeConfig {
            source: source.into(),
            target: target.into(),
            source_handle: source_handle.into(),
        });
    }

    pub fn with_edge(mut self, source: &str, target: &str) -> Self {
        self.connect(source, target);
        self
    }

    pub fn with_branch_edge(mut self, source: &str, handle: &str, target: &str) -> Self {
        self.connect_branch(source, handle, target);
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node specification in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Outputs substituted when the node fails under `default-value`
    #[serde(default)]
    pub default_value: serde_json::Map<String, serde_json::Value>,
    /// Type specific settings, decoded by the node implementation
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Body of a loop or iteration container
    #[serde(default)]
    pub body: Option<Box<GraphConfig>>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            node_type,
            error_strategy: ErrorStrategy::default(),
            retry: None,
            default_value: serde_json::Map::new(),
            data: serde_json::Map::new(),
            body: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    pub fn with_default_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.default_value.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, interval_ms: u64) -> Self {
        self.retry = Some(RetryConfig {
            max_attempts,
            interval_ms,
        });
        self
    }

    pub fn with_body(mut self, body: GraphConfig) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Decode `data` into the node's typed settings
    pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone()))
    }

    pub fn default_outputs(&self) -> BTreeMap<String, Value> {
        to_values(&self.default_value)
    }
}

/// Connection between nodes, optionally labelled with the branch it follows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default = "default_source_handle", alias = "sourceHandle")]
    pub source_handle: String,
}

fn default_source_handle() -> String {
    DEFAULT_SOURCE_HANDLE.to_string()
}

/// Retry policy for node execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    pub max_attempts: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

/// What happens to the run when a node fails after exhausting its retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    #[default]
    FailFast,
    ContinueOnError,
    DefaultValue,
}

/// Closed set of node types the engine knows how to schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    Tool,
    Code,
    IfElse,
    QuestionClassifier,
    HttpRequest,
    TemplateTransform,
    VariableAssigner,
    VariableAggregator,
    Loop,
    LoopStart,
    Iteration,
    IterationStart,
}

/// Scheduling role of a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionType {
    Root,
    Normal,
    /// Selects exactly one outgoing branch
    Branch,
    /// Contributes to the run's final outputs
    Response,
    /// Runs a body sub-graph instead of a node body
    Container,
}

impl NodeType {
    pub fn execution_type(self) -> ExecutionType {
        match self {
            NodeType::Start | NodeType::LoopStart | NodeType::IterationStart => ExecutionType::Root,
            NodeType::End | NodeType::Answer => ExecutionType::Response,
            NodeType::IfElse | NodeType::QuestionClassifier => ExecutionType::Branch,
            NodeType::Loop | NodeType::Iteration => ExecutionType::Container,
            _ => ExecutionType::Normal,
        }
    }

    pub fn is_container(self) -> bool {
        self.execution_type() == ExecutionType::Container
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Answer => "answer",
            NodeType::Llm => "llm",
            NodeType::Tool => "tool",
            NodeType::Code => "code",
            NodeType::IfElse => "if-else",
            NodeType::QuestionClassifier => "question-classifier",
            NodeType::HttpRequest => "http-request",
            NodeType::TemplateTransform => "template-transform",
            NodeType::VariableAssigner => "variable-assigner",
            NodeType::VariableAggregator => "variable-aggregator",
            NodeType::Loop => "loop",
            NodeType::LoopStart => "loop-start",
            NodeType::Iteration => "iteration",
            NodeType::IterationStart => "iteration-start",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_authored_graph_json() {
        let graph: GraphConfig = serde_json::from_value(json!({
            "nodes": [
                { "id": "start", "type": "start" },
                { "id": "branch", "type": "if-else", "error_strategy": "continue-on-error",
                  "retry": { "max_attempts": 2, "interval_ms": 10 } },
                { "id": "end", "type": "end" }
            ],
            "edges": [
                { "source": "start", "target": "branch" },
                { "source": "branch", "target": "end", "sourceHandle": "true" }
            ]
        }))
        .unwrap();

        assert_eq!(graph.nodes[1].node_type, NodeType::IfElse);
        assert_eq!(graph.nodes[1].error_strategy, ErrorStrategy::ContinueOnError);
        assert_eq!(graph.nodes[1].retry.unwrap().max_attempts, 2);
        assert_eq!(graph.edges[0].source_handle, DEFAULT_SOURCE_HANDLE);
        assert_eq!(graph.edges[1].source_handle, "true");
    }

    #[test]
    fn execution_types() {
        assert_eq!(NodeType::IfElse.execution_type(), ExecutionType::Branch);
        assert_eq!(NodeType::Answer.execution_type(), ExecutionType::Response);
        assert!(NodeType::Iteration.is_container());
        assert_eq!(NodeType::Llm.to_string(), "llm");
    }
}
