//! Mutable per-run state and its snapshot format.

use crate::graph::Graph;
use crate::readiness::EdgeState;
use crate::response::ResponseStreamState;
use chrono::{DateTime, Utc};
use flowcore::{NodeId, PoolSnapshot, Value, VariablePool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

const SNAPSHOT_VERSION: u32 = 1;

/// Output key whose values are concatenated across response nodes
pub const ANSWER_OUTPUT: &str = "answer";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("Snapshot does not match the graph: {0}")]
    GraphMismatch(String),
}

/// Node that was ready but not yet submitted when the run paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNode {
    pub node_id: NodeId,
    pub predecessor_node_id: Option<NodeId>,
}

/// Scheduling state of the root scope, kept to resume a paused run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphExecutionState {
    pub edge_states: Vec<EdgeState>,
    pub executed_nodes: Vec<NodeId>,
    pub skipped_nodes: Vec<NodeId>,
    pub ready_queue: Vec<PendingNode>,
    /// Response streaming progress, so a resumed run does not repeat chunks
    #[serde(default)]
    pub response_stream: Option<ResponseStreamState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimeStateSnapshot {
    version: u32,
    start_at: DateTime<Utc>,
    total_tokens: u64,
    node_run_steps: u64,
    exceptions_count: u64,
    outputs: BTreeMap<String, Value>,
    variable_pool: PoolSnapshot,
    #[serde(default)]
    execution: Option<GraphExecutionState>,
}

/// Variable pool plus run counters.
///
/// Layers get a shared reference and can only read; the coordinator is the
/// only writer of counters and outputs.
#[derive(Debug)]
pub struct RuntimeState {
    variable_pool: VariablePool,
    start_at: DateTime<Utc>,
    total_tokens: AtomicU64,
    node_run_steps: AtomicU64,
    exceptions_count: AtomicU64,
    ready_queue_size: AtomicUsize,
    outputs: Mutex<BTreeMap<String, Value>>,
    execution_state: Mutex<Option<GraphExecutionState>>,
}

impl RuntimeState {
    pub fn new(variable_pool: VariablePool) -> Self {
        Self {
            variable_pool,
            start_at: Utc::now(),
            total_tokens: AtomicU64::new(0),
            node_run_steps: AtomicU64::new(0),
            exceptions_count: AtomicU64::new(0),
            ready_queue_size: AtomicUsize::new(0),
            outputs: Mutex::new(BTreeMap::new()),
            execution_state: Mutex::new(None),
        }
    }

    pub fn variable_pool(&self) -> &VariablePool {
        &self.variable_pool
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::SeqCst)
    }

    pub fn node_run_steps(&self) -> u64 {
        self.node_run_steps.load(Ordering::SeqCst)
    }

    pub fn exceptions_count(&self) -> u64 {
        self.exceptions_count.load(Ordering::SeqCst)
    }

    pub fn ready_queue_size(&self) -> usize {
        self.ready_queue_size.load(Ordering::SeqCst)
    }

    /// Outputs collected from response nodes so far
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.outputs.lock().clone()
    }

    pub fn execution_state(&self) -> Option<GraphExecutionState> {
        self.execution_state.lock().clone()
    }

    pub(crate) fn add_tokens(&self, tokens: u64) {
        self.total_tokens.fetch_add(tokens, Ordering::SeqCst);
    }

    /// Returns the new step count
    pub(crate) fn increment_node_run_steps(&self) -> u64 {
        self.node_run_steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_exception(&self) {
        self.exceptions_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_ready_queue_size(&self, size: usize) {
        self.ready_queue_size.store(size, Ordering::SeqCst);
    }

    /// Merge a response node's outputs: `answer` is appended, other keys
    /// overwrite
    pub(crate) fn merge_response_outputs(&self, outputs: &BTreeMap<String, Value>) {
        let mut current = self.outputs.lock();
        for (key, value) in outputs {
            if key == ANSWER_OUTPUT {
                let mut answer = current
                    .get(ANSWER_OUTPUT)
                    .map(Value::to_text)
                    .unwrap_or_default();
                answer.push_str(&value.to_text());
                current.insert(key.clone(), Value::String(answer));
            } else {
                current.insert(key.clone(), value.clone());
            }
        }
    }

    pub(crate) fn set_execution_state(&self, state: Option<GraphExecutionState>) {
        *self.execution_state.lock() = state;
    }

    pub(crate) fn take_execution_state(&self) -> Option<GraphExecutionState> {
        self.execution_state.lock().take()
    }

    /// Serialize the whole state
    pub fn dumps(&self) -> Result<String, SnapshotError> {
        let snapshot = RuntimeStateSnapshot {
            version: SNAPSHOT_VERSION,
            start_at: self.start_at,
            total_tokens: self.total_tokens(),
            node_run_steps: self.node_run_steps(),
            exceptions_count: self.exceptions_count(),
            outputs: self.outputs(),
            variable_pool: self.variable_pool.snapshot(),
            execution: self.execution_state(),
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Rebuild a state produced by [`dumps`](Self::dumps), checking that the
    /// stored scheduling state fits `graph`
    pub fn restore(snapshot: &str, graph: &Graph) -> Result<RuntimeState, SnapshotError> {
        let snapshot: RuntimeStateSnapshot = serde_json::from_str(snapshot)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        if let Some(execution) = &snapshot.execution {
            if execution.edge_states.len() != graph.edges().len() {
                return Err(SnapshotError::GraphMismatch(format!(
                    "snapshot has {} edge states, graph has {} edges",
                    execution.edge_states.len(),
                    graph.edges().len()
                )));
            }
            let referenced = execution
                .executed_nodes
                .iter()
                .chain(&execution.skipped_nodes)
                .chain(execution.ready_queue.iter().map(|p| &p.node_id));
            for node_id in referenced {
                if !graph.contains(node_id) {
                    return Err(SnapshotError::GraphMismatch(format!(
                        "unknown node {}",
                        node_id
                    )));
                }
            }
        }

        Ok(RuntimeState {
            variable_pool: VariablePool::from_snapshot(snapshot.variable_pool),
            start_at: snapshot.start_at,
            total_tokens: AtomicU64::new(snapshot.total_tokens),
            node_run_steps: AtomicU64::new(snapshot.node_run_steps),
            exceptions_count: AtomicU64::new(snapshot.exceptions_count),
            ready_queue_size: AtomicUsize::new(
                snapshot.execution.as_ref().map_or(0, |e| e.ready_queue.len()),
            ),
            outputs: Mutex::new(snapshot.outputs),
            execution_state: Mutex::new(snapshot.execution),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_concatenate_and_other_keys_overwrite() {
        let state = RuntimeState::new(VariablePool::new());
        state.merge_response_outputs(&BTreeMap::from([
            ("answer".to_string(), Value::from("Hello, ")),
            ("score".to_string(), Value::from(1i64)),
        ]));
        state.merge_response_outputs(&BTreeMap::from([
            ("answer".to_string(), Value::from("world")),
            ("score".to_string(), Value::from(2i64)),
        ]));
        let outputs = state.outputs();
        assert_eq!(outputs["answer"], Value::from("Hello, world"));
        assert_eq!(outputs["score"], Value::from(2i64));
    }

    #[test]
    fn counters() {
        let state = RuntimeState::new(VariablePool::new());
        assert_eq!(state.increment_node_run_steps(), 1);
        assert_eq!(state.increment_node_run_steps(), 2);
        state.add_tokens(30);
        state.record_exception();
        assert_eq!(state.total_tokens(), 30);
        assert_eq!(state.exceptions_count(), 1);
    }
}
