// Shared helpers for the runtime integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::commands::InMemoryCommandTransport;
use flowcore::{
    GraphConfig, GraphEvent, Node, NodeConfig, NodeContext, NodeError,
    NodeExecutionStatus, NodeRunResult, NodeType, ResponseTemplate, Value, VariablePool,
};
use flowruntime::{EngineConfig, FlowRuntime, GraphEngine, Graph, NodeRegistry, RuntimeState};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Number of runs per node id, across every scope
#[derive(Clone, Default)]
pub struct RunLog(Arc<Mutex<HashMap<String, usize>>>);

impl RunLog {
    pub fn count(&self, node_id: &str) -> usize {
        self.0.lock().get(node_id).copied().unwrap_or(0)
    }

    fn record(&self, node_id: &str) {
        *self.0.lock().entry(node_id.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Default, Deserialize)]
struct Script {
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    collect: Vec<Collect>,
    #[serde(default)]
    echo: Option<Vec<String>>,
    #[serde(default)]
    double: Option<Vec<String>>,
    #[serde(default)]
    increment: Option<Vec<String>>,
    #[serde(default)]
    delay_ms: u64,
    /// Read the delay in milliseconds from a variable
    #[serde(default)]
    delay_from: Option<Vec<String>>,
    #[serde(default)]
    fail: Option<String>,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    tokens: u64,
    /// Answer template, rendered into `answer` and streamed by the engine
    #[serde(default)]
    answer: Option<String>,
    /// Pieces streamed to the `text` output, `stream_delay_ms` apart
    #[serde(default)]
    stream: Vec<String>,
    #[serde(default)]
    stream_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct Collect {
    variable: String,
    value_selector: Vec<String>,
}

/// Node whose behaviour is read from its config data
struct Scripted {
    node_type: NodeType,
    log: RunLog,
}

#[async_trait]
impl Node for Scripted {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        self.log.record(&ctx.node_id);
        let script: Script = ctx.data()?;

        let delay_ms = match &script.delay_from {
            Some(selector) => ctx.require_variable(selector)?.as_f64().unwrap_or_default() as u64,
            None => script.delay_ms,
        };
        if delay_ms > 0 {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
        if let Some(message) = script.fail {
            return Err(NodeError::ExecutionFailed(message));
        }
        if !script.stream.is_empty() {
            let last = script.stream.len() - 1;
            for (i, piece) in script.stream.iter().enumerate() {
                ctx.stream("text", piece.clone(), i == last);
                tokio::time::sleep(Duration::from_millis(script.stream_delay_ms)).await;
            }
        }

        let mut result = NodeRunResult::new().with_tokens(script.tokens);
        if self.node_type == NodeType::Start {
            result = result.with_outputs(ctx.variable_pool.user_inputs());
        }
        for (name, value) in script.outputs {
            result = result.with_output(name, Value::from_json(value));
        }
        for collect in script.collect {
            let value = ctx.variable_pool.get(&collect.value_selector).unwrap_or(Value::Null);
            result = result.with_output(collect.variable, value);
        }
        if let Some(selector) = script.echo {
            result = result.with_output("value", ctx.require_variable(&selector)?);
        }
        if let Some(selector) = script.double {
            let n = ctx.require_variable(&selector)?.as_f64().unwrap_or_default();
            result = result.with_output("value", n * 2.0);
        }
        if let Some(selector) = script.increment {
            let n = ctx.require_variable(&selector)?.as_f64().unwrap_or_default();
            ctx.variable_pool.assign(&selector, Value::from(n + 1.0))?;
        }
        if let Some(handle) = script.handle {
            result = result.with_edge_source_handle(handle);
        }
        if !script.stream.is_empty() {
            result = result.with_output("text", script.stream.concat());
        }
        if let Some(answer) = script.answer {
            let rendered = ResponseTemplate::parse(&answer).render(&ctx.variable_pool);
            result = result.with_output("answer", rendered);
        }
        Ok(result)
    }

    fn streaming_template(&self, config: &NodeConfig) -> Option<ResponseTemplate> {
        if self.node_type != NodeType::Answer {
            return None;
        }
        let answer = config.data.get("answer")?.as_str()?;
        Some(ResponseTemplate::parse(answer))
    }
}

pub const SCRIPTED_TYPES: [NodeType; 10] = [
    NodeType::Start,
    NodeType::End,
    NodeType::Answer,
    NodeType::Code,
    NodeType::Tool,
    NodeType::Llm,
    NodeType::IfElse,
    NodeType::LoopStart,
    NodeType::IterationStart,
    NodeType::VariableAssigner,
];

pub fn registry() -> (NodeRegistry, RunLog) {
    let log = RunLog::default();
    let mut registry = NodeRegistry::new();
    for node_type in SCRIPTED_TYPES {
        let log = log.clone();
        registry.register_fn(node_type, Default::default(), move |config| {
            Ok(Arc::new(Scripted {
                node_type: config.node_type,
                log: log.clone(),
            }) as Arc<dyn Node>)
        });
    }
    (registry, log)
}

pub fn start() -> NodeConfig {
    NodeConfig::new("start", NodeType::Start)
}

pub fn code(id: &str) -> NodeConfig {
    NodeConfig::new(id, NodeType::Code)
}

pub fn emit(id: &str, name: &str, value: serde_json::Value) -> NodeConfig {
    let mut outputs = serde_json::Map::new();
    outputs.insert(name.to_string(), value);
    code(id).with_data("outputs", serde_json::Value::Object(outputs))
}

pub fn slow(id: &str, delay_ms: u64) -> NodeConfig {
    code(id)
        .with_data("delay_ms", json!(delay_ms))
        .with_data("outputs", json!({ "output": id }))
}

pub fn failing(id: &str, message: &str) -> NodeConfig {
    code(id).with_data("fail", json!(message))
}

pub fn branch(id: &str, handle: &str) -> NodeConfig {
    NodeConfig::new(id, NodeType::IfElse).with_data("handle", json!(handle))
}

/// Answer node streaming `template`
pub fn answer(id: &str, template: &str) -> NodeConfig {
    NodeConfig::new(id, NodeType::Answer).with_data("answer", json!(template))
}

/// Node streaming `pieces` to its `text` output
pub fn streaming(id: &str, pieces: &[&str], delay_ms: u64) -> NodeConfig {
    code(id)
        .with_data("stream", json!(pieces))
        .with_data("stream_delay_ms", json!(delay_ms))
}

/// `(chunk, is_final)` of every stream chunk, in event order
pub fn stream_chunks(events: &[GraphEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::NodeRunStreamChunk { chunk, is_final, .. } => Some((chunk.clone(), *is_final)),
            _ => None,
        })
        .collect()
}

/// End node exposing `selector` under `name`
pub fn end(name: &str, selector: &[&str]) -> NodeConfig {
    NodeConfig::new("end", NodeType::End)
        .with_data("collect", json!([{ "variable": name, "value_selector": selector }]))
}

/// Route engine logs through the test harness; `RUST_LOG=debug` shows
/// scheduling decisions
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn runtime(registry: NodeRegistry) -> FlowRuntime {
    init_tracing();
    FlowRuntime::with_registry(Arc::new(registry), Default::default())
}

pub fn build(registry: &NodeRegistry, config: &GraphConfig) -> Arc<Graph> {
    Arc::new(Graph::build(config, registry).expect("graph should build"))
}

pub struct Harness {
    pub engine: GraphEngine,
    pub transport: Arc<InMemoryCommandTransport>,
    pub state: Arc<RuntimeState>,
}

/// Engine over `graph` with an in-memory command transport the test can
/// publish to
pub fn harness(graph: Arc<Graph>, inputs: BTreeMap<String, Value>, config: EngineConfig) -> Harness {
    let state = Arc::new(RuntimeState::new(VariablePool::new().with_user_inputs(inputs)));
    harness_with_state(graph, state, config)
}

pub fn harness_with_state(graph: Arc<Graph>, state: Arc<RuntimeState>, config: EngineConfig) -> Harness {
    init_tracing();
    let transport = Arc::new(InMemoryCommandTransport::new());
    let run_id = Uuid::new_v4();
    let channel = flowcore::CommandChannel::new(run_id, transport.clone());
    let engine = GraphEngine::new(run_id, graph, state.clone(), config, channel);
    Harness {
        engine,
        transport,
        state,
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        command_poll_interval_ms: 5,
        ..Default::default()
    }
}

pub fn terminal(events: &[GraphEvent]) -> &GraphEvent {
    events
        .iter()
        .rev()
        .find(|e| e.is_terminal())
        .expect("run should end with a terminal event")
}

pub fn started_nodes(events: &[GraphEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::NodeRunStarted { execution, .. } => Some(execution.node_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn finished_status(events: &[GraphEvent], node_id: &str) -> Option<NodeExecutionStatus> {
    events.iter().rev().find_map(|e| match e {
        GraphEvent::NodeRunSucceeded { execution, .. }
        | GraphEvent::NodeRunFailed { execution, .. }
        | GraphEvent::NodeRunException { execution, .. }
            if execution.node_id == node_id =>
        {
            Some(execution.status)
        }
        _ => None,
    })
}

pub fn position(events: &[GraphEvent], predicate: impl Fn(&GraphEvent) -> bool) -> usize {
    events
        .iter()
        .position(predicate)
        .expect("expected event is missing")
}
