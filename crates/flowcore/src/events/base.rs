use crate::{NodeId, NodeType, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Exception,
    Retry,
}

/// Execution record of one node invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub title: String,
    /// Submission order within the run
    pub index: u64,
    pub predecessor_node_id: Option<NodeId>,
    pub status: NodeExecutionStatus,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub process_data: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub in_loop_id: Option<NodeId>,
    pub in_iteration_id: Option<NodeId>,
    /// Loop round or iteration element index when running inside a container
    pub scope_index: Option<usize>,
}

impl NodeExecution {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Events emitted while a graph runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphEvent {
    WorkflowRunStarted {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    WorkflowRunSucceeded {
        run_id: RunId,
        outputs: BTreeMap<String, Value>,
        exceptions_count: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowRunFailed {
        run_id: RunId,
        error: String,
        node_id: Option<NodeId>,
        exceptions_count: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowRunStopped {
        run_id: RunId,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowRunPaused {
        run_id: RunId,
        reason: Option<String>,
        /// Output of `RuntimeState::dumps`, fed back to resume the run
        snapshot: String,
        timestamp: DateTime<Utc>,
    },
    NodeRunStarted {
        run_id: RunId,
        execution: NodeExecution,
    },
    NodeRunSucceeded {
        run_id: RunId,
        execution: NodeExecution,
    },
    NodeRunFailed {
        run_id: RunId,
        execution: NodeExecution,
    },
    /// Node failed but its error strategy kept the run going
    NodeRunException {
        run_id: RunId,
        execution: NodeExecution,
    },
    NodeRunRetry {
        run_id: RunId,
        execution: NodeExecution,
        retry_index: u32,
    },
    /// Piece of a response released in template order
    NodeRunStreamChunk {
        run_id: RunId,
        /// Node whose output the chunk came from
        node_id: NodeId,
        /// Response node whose template the chunk belongs to
        response_node_id: NodeId,
        selector: Vec<String>,
        chunk: String,
        /// Last chunk of the response
        is_final: bool,
    },
    LoopStarted {
        run_id: RunId,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    LoopNext {
        run_id: RunId,
        node_id: NodeId,
        index: usize,
        timestamp: DateTime<Utc>,
    },
    LoopSucceeded {
        run_id: RunId,
        node_id: NodeId,
        steps: usize,
        outputs: BTreeMap<String, Value>,
        timestamp: DateTime<Utc>,
    },
    LoopFailed {
        run_id: RunId,
        node_id: NodeId,
        steps: usize,
        error: String,
        timestamp: DateTime<Utc>,
    },
    IterationStarted {
        run_id: RunId,
        node_id: NodeId,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    IterationNext {
        run_id: RunId,
        node_id: NodeId,
        index: usize,
        timestamp: DateTime<Utc>,
    },
    IterationSucceeded {
        run_id: RunId,
        node_id: NodeId,
        outputs: BTreeMap<String, Value>,
        timestamp: DateTime<Utc>,
    },
    IterationFailed {
        run_id: RunId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl GraphEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            GraphEvent::WorkflowRunStarted { run_id, .. }
            | GraphEvent::WorkflowRunSucceeded { run_id, .. }
            | GraphEvent::WorkflowRunFailed { run_id, .. }
            | GraphEvent::WorkflowRunStopped { run_id, .. }
            | GraphEvent::WorkflowRunPaused { run_id, .. }
            | GraphEvent::NodeRunStarted { run_id, .. }
            | GraphEvent::NodeRunSucceeded { run_id, .. }
            | GraphEvent::NodeRunFailed { run_id, .. }
            | GraphEvent::NodeRunException { run_id, .. }
            | GraphEvent::NodeRunRetry { run_id, .. }
            | GraphEvent::NodeRunStreamChunk { run_id, .. }
            | GraphEvent::LoopStarted { run_id, .. }
            | GraphEvent::LoopNext { run_id, .. }
            | GraphEvent::LoopSucceeded { run_id, .. }
            | GraphEvent::LoopFailed { run_id, .. }
            | GraphEvent::IterationStarted { run_id, .. }
            | GraphEvent::IterationNext { run_id, .. }
            | GraphEvent::IterationSucceeded { run_id, .. }
            | GraphEvent::IterationFailed { run_id, .. } => *run_id,
        }
    }

    /// Node execution record carried by node-level events
    pub fn execution(&self) -> Option<&NodeExecution> {
        match self {
            GraphEvent::NodeRunStarted { execution, .. }
            | GraphEvent::NodeRunSucceeded { execution, .. }
            | GraphEvent::NodeRunFailed { execution, .. }
            | GraphEvent::NodeRunException { execution, .. }
            | GraphEvent::NodeRunRetry { execution, .. } => Some(execution),
            _ => None,
        }
    }

    /// Whether this is one of the run's final events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphEvent::WorkflowRunSucceeded { .. }
                | GraphEvent::WorkflowRunFailed { .. }
                | GraphEvent::WorkflowRunStopped { .. }
                | GraphEvent::WorkflowRunPaused { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            GraphEvent::WorkflowRunStarted { .. } => "workflow_run_started",
            GraphEvent::WorkflowRunSucceeded { .. } => "workflow_run_succeeded",
            GraphEvent::WorkflowRunFailed { .. } => "workflow_run_failed",
            GraphEvent::WorkflowRunStopped { .. } => "workflow_run_stopped",
            GraphEvent::WorkflowRunPaused { .. } => "workflow_run_paused",
            GraphEvent::NodeRunStarted { .. } => "node_run_started",
            GraphEvent::NodeRunSucceeded { .. } => "node_run_succeeded",
            GraphEvent::NodeRunFailed { .. } => "node_run_failed",
            GraphEvent::NodeRunException { .. } => "node_run_exception",
            GraphEvent::NodeRunRetry { .. } => "node_run_retry",
            GraphEvent::NodeRunStreamChunk { .. } => "node_run_stream_chunk",
            GraphEvent::LoopStarted { .. } => "loop_started",
            GraphEvent::LoopNext { .. } => "loop_next",
            GraphEvent::LoopSucceeded { .. } => "loop_succeeded",
            GraphEvent::LoopFailed { .. } => "loop_failed",
            GraphEvent::IterationStarted { .. } => "iteration_started",
            GraphEvent::IterationNext { .. } => "iteration_next",
            GraphEvent::IterationSucceeded { .. } => "iteration_succeeded",
            GraphEvent::IterationFailed { .. } => "iteration_failed",
        }
    }
}

/// Process-wide fan-out of graph events
pub struct EventBus {
    sender: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: GraphEvent) {
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> broadcast::Sender<GraphEvent> {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_fans_out_to_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let run_id = Uuid::new_v4();
        bus.emit(GraphEvent::WorkflowRunStarted {
            run_id,
            timestamp: Utc::now(),
        });

        assert_eq!(a.recv().await.unwrap().run_id(), run_id);
        assert_eq!(b.recv().await.unwrap().name(), "workflow_run_started");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = GraphEvent::WorkflowRunStopped {
            run_id: Uuid::nil(),
            reason: Some("user".to_string()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "WorkflowRunStopped");
        assert!(event.is_terminal());
    }
}
