use super::{Layer, LayerContext};
use crate::state::RuntimeState;
use flowcore::GraphEvent;

/// Writes run lifecycle and node results to `tracing`
#[derive(Debug, Default)]
pub struct LoggingLayer;

impl LoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Layer for LoggingLayer {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_graph_start(&mut self, ctx: &LayerContext<'_>) {
        tracing::info!(
            run_id = %ctx.run_id,
            root = ctx.root_node_id,
            resumed = ctx.resumed,
            "Workflow run started"
        );
    }

    fn on_event(&mut self, event: &GraphEvent, _state: &RuntimeState) {
        match event {
            GraphEvent::NodeRunStarted { execution, .. } => {
                tracing::debug!(
                    node_id = %execution.node_id,
                    node_type = %execution.node_type,
                    index = execution.index,
                    "Node started"
                );
            }
            GraphEvent::NodeRunSucceeded { execution, .. } => {
                tracing::info!(
                    node_id = %execution.node_id,
                    elapsed_ms = execution.elapsed_ms,
                    "Node succeeded"
                );
            }
            GraphEvent::NodeRunFailed { execution, .. } => {
                tracing::error!(
                    node_id = %execution.node_id,
                    error = execution.error.as_deref().unwrap_or_default(),
                    "Node failed"
                );
            }
            GraphEvent::NodeRunException { execution, .. } => {
                tracing::warn!(
                    node_id = %execution.node_id,
                    error = execution.error.as_deref().unwrap_or_default(),
                    "Node failed, run continues"
                );
            }
            GraphEvent::NodeRunRetry {
                execution,
                retry_index,
                ..
            } => {
                tracing::warn!(node_id = %execution.node_id, retry_index, "Node retry");
            }
            GraphEvent::NodeRunStreamChunk {
                response_node_id,
                selector,
                is_final,
                ..
            } => {
                tracing::trace!(
                    response_node_id = %response_node_id,
                    selector = %selector.join("."),
                    is_final,
                    "Response chunk"
                );
            }
            GraphEvent::WorkflowRunStopped { reason, .. } => {
                tracing::info!(reason = reason.as_deref().unwrap_or_default(), "Workflow run stopped");
            }
            GraphEvent::WorkflowRunPaused { reason, .. } => {
                tracing::info!(reason = reason.as_deref().unwrap_or_default(), "Workflow run paused");
            }
            other => tracing::trace!(event = other.name(), "Graph event"),
        }
    }

    fn on_graph_end(&mut self, error: Option<&str>, state: &RuntimeState) {
        match error {
            Some(error) => tracing::error!(
                error,
                steps = state.node_run_steps(),
                "Workflow run failed"
            ),
            None => tracing::info!(
                steps = state.node_run_steps(),
                total_tokens = state.total_tokens(),
                exceptions = state.exceptions_count(),
                "Workflow run finished"
            ),
        }
    }
}
