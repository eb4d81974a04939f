use super::Layer;
use crate::state::RuntimeState;
use flowcore::{GraphEvent, NodeExecution, RunId};
use std::sync::Arc;

/// Storage for execution records, supplied by the embedding application
pub trait ExecutionRepository: Send + Sync {
    /// Called once per finalised node execution record
    fn on_node_finished(&self, record: &NodeExecution);

    /// Called with the snapshot of a paused run
    fn on_run_paused(&self, run_id: RunId, snapshot: &str);
}

/// Hands finished records and pause snapshots to an [`ExecutionRepository`]
pub struct PersistenceLayer {
    repository: Arc<dyn ExecutionRepository>,
}

impl PersistenceLayer {
    pub fn new(repository: Arc<dyn ExecutionRepository>) -> Self {
        Self { repository }
    }
}

impl Layer for PersistenceLayer {
    fn name(&self) -> &str {
        "persistence"
    }

    fn on_event(&mut self, event: &GraphEvent, _state: &RuntimeState) {
        match event {
            GraphEvent::NodeRunSucceeded { execution, .. }
            | GraphEvent::NodeRunFailed { execution, .. }
            | GraphEvent::NodeRunException { execution, .. } => {
                self.repository.on_node_finished(execution);
            }
            GraphEvent::WorkflowRunPaused {
                run_id, snapshot, ..
            } => self.repository.on_run_paused(*run_id, snapshot),
            _ => {}
        }
    }
}
