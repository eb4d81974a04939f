use crate::config::EngineConfig;
use crate::engine::{GraphEngine, GraphRun};
use crate::error::EngineError;
use crate::graph::Graph;
use crate::layers::{EventBusLayer, LoggingLayer};
use crate::registry::NodeRegistry;
use crate::state::RuntimeState;
use flowcore::commands::InMemoryCommandTransport;
use flowcore::{
    CommandChannel, CommandSender, CommandTransport, EventBus, GraphConfig, GraphEvent,
    SystemVariables, Value, VariablePool, WorkflowConfig, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    commands: Arc<dyn CommandTransport>,
    config: RuntimeConfig,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowConfig>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.engine.event_buffer_size));

        Self {
            registry,
            event_bus,
            commands: Arc::new(InMemoryCommandTransport::new()),
            config,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Route pause and abort commands through another transport
    pub fn with_command_transport(mut self, transport: Arc<dyn CommandTransport>) -> Self {
        self.commands = transport;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn build_graph(&self, config: &GraphConfig) -> Result<Arc<Graph>, EngineError> {
        Ok(Arc::new(Graph::build(config, &self.registry)?))
    }

    /// Engine for one run with the runtime's logging and event bus layers
    /// attached
    pub fn engine(&self, graph: Arc<Graph>, state: Arc<RuntimeState>) -> GraphEngine {
        let run_id = Uuid::new_v4();
        let commands = CommandChannel::new(run_id, self.commands.clone());
        GraphEngine::new(run_id, graph, state, self.config.engine.clone(), commands)
            .layer(LoggingLayer::new())
            .layer(EventBusLayer::new(self.event_bus.clone()))
    }

    /// Seed a fresh runtime state for `workflow`
    pub fn initial_state(
        &self,
        workflow: &WorkflowConfig,
        inputs: BTreeMap<String, Value>,
        system: SystemVariables,
    ) -> RuntimeState {
        let pool = VariablePool::new()
            .with_system_variables(system)
            .with_environment_variables(workflow.environment())
            .with_conversation_variables(workflow.conversation())
            .with_user_inputs(inputs);
        RuntimeState::new(pool)
    }

    /// Build the workflow's graph and start a run
    pub fn start(
        &self,
        workflow: &WorkflowConfig,
        inputs: BTreeMap<String, Value>,
    ) -> Result<GraphRun, EngineError> {
        let graph = self.build_graph(&workflow.graph)?;
        let system = SystemVariables {
            workflow_id: Some(workflow.id.clone()),
            ..Default::default()
        };
        let state = Arc::new(self.initial_state(workflow, inputs, system));
        let engine = self.engine(graph, state);
        tracing::info!(workflow_id = %workflow.id, run_id = %engine.run_id(), "Starting workflow");
        Ok(engine.run())
    }

    /// Continue a paused run from the snapshot carried by its
    /// `WorkflowRunPaused` event
    pub fn resume(&self, graph: Arc<Graph>, snapshot: &str) -> Result<GraphRun, EngineError> {
        let state = Arc::new(RuntimeState::restore(snapshot, &graph)?);
        Ok(self.engine(graph, state).run())
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: WorkflowConfig) {
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.clone(), workflow);
    }

    /// Execute a registered workflow by id
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        inputs: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let workflow = {
            let workflows = self.workflows.read().await;
            workflows
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?
        };
        self.execute(&workflow, inputs).await
    }

    /// Execute a workflow directly (without registration) and wait for its
    /// outputs
    pub async fn execute(
        &self,
        workflow: &WorkflowConfig,
        inputs: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let run = self.start(workflow, inputs)?;
        run_outputs(run).await
    }

    /// Sender for pause and abort commands addressed by run id
    pub fn command_sender(&self) -> CommandSender {
        CommandSender::new(self.commands.clone())
    }

    /// Subscribe to the events of every run started by this runtime
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<GraphEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume a run's events and turn its terminal event into a result
pub async fn run_outputs(mut run: GraphRun) -> Result<BTreeMap<String, Value>, EngineError> {
    while let Some(event) = run.next_event().await {
        match event {
            GraphEvent::WorkflowRunSucceeded { outputs, .. } => return Ok(outputs),
            GraphEvent::WorkflowRunFailed { error, node_id, .. } => {
                return Err(EngineError::RunFailed { error, node_id })
            }
            GraphEvent::WorkflowRunStopped { reason, .. } => {
                return Err(EngineError::RunAborted(reason))
            }
            GraphEvent::WorkflowRunPaused { snapshot, .. } => {
                return Err(EngineError::RunPaused { snapshot })
            }
            _ => {}
        }
    }
    Err(EngineError::Incomplete)
}

/// Configuration for the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}
