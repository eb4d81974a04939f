//! Ordered streaming of response nodes.
//!
//! Each response node with a template gets a session. A session becomes
//! active once the node is certain to run, which is when some root-to-node
//! path has no unresolved branch or container edge left. Only one session
//! streams at a time; the others queue in activation order. The active
//! session walks its template: text goes out at once, a variable waits for
//! chunks streamed by its source node or for the source's final value.
//! A variable whose source was skipped is dropped.

use crate::graph::{Graph, NodeKind};
use crate::state::ANSWER_OUTPUT;
use flowcore::{
    ExecutionType, GraphEvent, NodeId, ResponseTemplate, RunId, StreamChunk, TemplateSegment,
    VariablePool,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub node_id: NodeId,
    /// Next template segment to stream
    pub index: usize,
}

/// Response node still waiting to become reachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSession {
    pub node_id: NodeId,
    /// Unresolved branch and container edges, one list per path from the root
    pub paths: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub selector: Vec<String>,
    pub chunks: Vec<String>,
    /// Chunks already forwarded
    pub position: usize,
    pub closed: bool,
}

/// Serializable state of the response streams, saved with a paused run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStreamState {
    pub pending: Vec<PendingSession>,
    pub active: Option<SessionState>,
    pub waiting: VecDeque<SessionState>,
    pub buffers: Vec<StreamBuffer>,
    pub finished_nodes: BTreeSet<NodeId>,
    pub skipped_nodes: BTreeSet<NodeId>,
}

pub(crate) struct ResponseCoordinator {
    run_id: RunId,
    graph: Arc<Graph>,
    templates: BTreeMap<NodeId, ResponseTemplate>,
    state: ResponseStreamState,
}

impl ResponseCoordinator {
    /// Register every response node of `graph` that exposes a template
    pub fn new(run_id: RunId, graph: Arc<Graph>) -> Self {
        let mut templates = BTreeMap::new();
        let mut pending = Vec::new();
        for (node_id, node) in graph.walk_nodes() {
            if node.execution_type() != ExecutionType::Response {
                continue;
            }
            let NodeKind::Executable(executable) = &node.kind else {
                continue;
            };
            let Some(template) = executable.streaming_template(&node.config) else {
                continue;
            };
            pending.push(PendingSession {
                node_id: node_id.to_string(),
                paths: blocking_paths(&graph, node_id),
            });
            templates.insert(node_id.to_string(), template);
        }
        tracing::debug!(run_id = %run_id, sessions = pending.len(), "Response sessions registered");

        Self {
            run_id,
            graph,
            templates,
            state: ResponseStreamState {
                pending,
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> &ResponseStreamState {
        &self.state
    }

    /// Continue from a saved state; sessions unknown to this graph are dropped
    pub fn restore(&mut self, state: ResponseStreamState) {
        let known = |node_id: &NodeId| self.templates.contains_key(node_id);
        let mut state = state;
        state.pending.retain(|session| known(&session.node_id));
        state.waiting.retain(|session| known(&session.node_id));
        if state.active.as_ref().is_some_and(|session| !known(&session.node_id)) {
            state.active = None;
        }
        self.state = state;
    }

    /// Activate sessions reachable without resolving any branch
    pub fn start(&mut self, pool: &VariablePool) -> Vec<GraphEvent> {
        self.activate_reachable(pool)
    }

    pub fn on_edge_taken(&mut self, edge: usize, pool: &VariablePool) -> Vec<GraphEvent> {
        for session in &mut self.state.pending {
            for path in &mut session.paths {
                path.retain(|&e| e != edge);
            }
        }
        self.activate_reachable(pool)
    }

    pub fn on_node_skipped(&mut self, node_id: &str, pool: &VariablePool) -> Vec<GraphEvent> {
        self.state.skipped_nodes.insert(node_id.to_string());
        self.try_flush(pool)
    }

    /// The node's outputs are in the pool; its streams take no more chunks
    pub fn on_node_finished(&mut self, node_id: &str, pool: &VariablePool) -> Vec<GraphEvent> {
        self.state.finished_nodes.insert(node_id.to_string());
        for buffer in &mut self.state.buffers {
            if buffer.selector.first().map(String::as_str) == Some(node_id) {
                buffer.closed = true;
            }
        }
        self.try_flush(pool)
    }

    pub fn on_chunk(&mut self, chunk: StreamChunk, pool: &VariablePool) -> Vec<GraphEvent> {
        let buffer = match self
            .state
            .buffers
            .iter_mut()
            .position(|buffer| buffer.selector == chunk.selector)
        {
            Some(i) => &mut self.state.buffers[i],
            None => {
                self.state.buffers.push(StreamBuffer {
                    selector: chunk.selector.clone(),
                    chunks: Vec::new(),
                    position: 0,
                    closed: false,
                });
                let last = self.state.buffers.len() - 1;
                &mut self.state.buffers[last]
            }
        };
        if buffer.closed {
            tracing::warn!(selector = %chunk.selector.join("."), "Chunk for a closed stream dropped");
            return Vec::new();
        }
        buffer.chunks.push(chunk.chunk);
        buffer.closed = chunk.is_final;
        self.try_flush(pool)
    }

    fn activate_reachable(&mut self, pool: &VariablePool) -> Vec<GraphEvent> {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.state.pending)
            .into_iter()
            .partition(|session| session.paths.iter().any(Vec::is_empty));
        self.state.pending = pending;
        if ready.is_empty() {
            return Vec::new();
        }
        for session in ready {
            tracing::debug!(node_id = %session.node_id, "Response session queued");
            self.state.waiting.push_back(SessionState {
                node_id: session.node_id,
                index: 0,
            });
        }
        self.try_flush(pool)
    }

    /// Stream as much of the active session as is available, moving on to
    /// waiting sessions as each one completes
    fn try_flush(&mut self, pool: &VariablePool) -> Vec<GraphEvent> {
        let mut events = Vec::new();
        loop {
            if self.state.active.is_none() {
                match self.state.waiting.pop_front() {
                    Some(next) => self.state.active = Some(next),
                    None => return events,
                }
            }
            let Some(mut session) = self.state.active.take() else {
                return events;
            };
            let Some(template) = self.templates.get(&session.node_id).cloned() else {
                continue;
            };

            let first = events.len();
            let mut blocked = false;
            while let Some(segment) = template.segments.get(session.index) {
                match segment {
                    TemplateSegment::Text(text) => {
                        events.push(self.chunk_event(
                            &session.node_id,
                            &session.node_id,
                            vec![session.node_id.clone(), ANSWER_OUTPUT.to_string()],
                            text.clone(),
                        ));
                    }
                    TemplateSegment::Variable(selector) => {
                        if !self.stream_variable(&session.node_id, selector, pool, &mut events) {
                            blocked = true;
                            break;
                        }
                    }
                }
                session.index += 1;
            }

            if blocked {
                self.state.active = Some(session);
                return events;
            }
            if events.len() == first {
                events.push(self.chunk_event(
                    &session.node_id,
                    &session.node_id,
                    vec![session.node_id.clone(), ANSWER_OUTPUT.to_string()],
                    String::new(),
                ));
            }
            if let Some(GraphEvent::NodeRunStreamChunk { is_final, .. }) = events.last_mut() {
                *is_final = true;
            }
            tracing::debug!(node_id = %session.node_id, "Response session finished");
        }
    }

    /// Forward what is available for one variable segment. Returns whether
    /// the segment is complete.
    fn stream_variable(
        &mut self,
        response_node_id: &str,
        selector: &[String],
        pool: &VariablePool,
        events: &mut Vec<GraphEvent>,
    ) -> bool {
        let Some(source) = selector.first() else {
            return true;
        };
        let from_node = self.graph.contains(source);
        if from_node && self.state.skipped_nodes.contains(source) {
            return true;
        }
        // sys, env and conversation values are attributed to the response node
        let owner = if from_node { source.as_str() } else { response_node_id };

        let stream = self
            .state
            .buffers
            .iter_mut()
            .find(|buffer| buffer.selector == selector)
            .map(|buffer| {
                let fresh = buffer.chunks[buffer.position..].to_vec();
                buffer.position = buffer.chunks.len();
                (fresh, buffer.closed)
            });
        if let Some((fresh, closed)) = stream {
            for chunk in fresh {
                events.push(self.chunk_event(owner, response_node_id, selector.to_vec(), chunk));
            }
            return closed;
        }

        if !from_node || self.state.finished_nodes.contains(source) {
            let text = pool.get(selector).map(|v| v.to_text()).unwrap_or_default();
            if !text.is_empty() {
                events.push(self.chunk_event(owner, response_node_id, selector.to_vec(), text));
            }
            return true;
        }
        false
    }

    fn chunk_event(
        &self,
        node_id: &str,
        response_node_id: &str,
        selector: Vec<String>,
        chunk: String,
    ) -> GraphEvent {
        GraphEvent::NodeRunStreamChunk {
            run_id: self.run_id,
            node_id: node_id.to_string(),
            response_node_id: response_node_id.to_string(),
            selector,
            chunk,
            is_final: false,
        }
    }
}

/// Branch and container edges on every simple path from the root to
/// `target`, deduplicated
fn blocking_paths(graph: &Graph, target: &str) -> Vec<Vec<usize>> {
    let mut paths = BTreeSet::new();
    let mut visited = BTreeSet::new();
    let mut current = Vec::new();
    collect_paths(graph, graph.root_id(), target, &mut visited, &mut current, &mut paths);
    paths.into_iter().collect()
}

fn collect_paths(
    graph: &Graph,
    node_id: &str,
    target: &str,
    visited: &mut BTreeSet<NodeId>,
    current: &mut Vec<usize>,
    paths: &mut BTreeSet<Vec<usize>>,
) {
    if node_id == target {
        paths.insert(current.clone());
        return;
    }
    visited.insert(node_id.to_string());
    let blocking = graph.node(node_id).is_some_and(|node| {
        matches!(
            node.execution_type(),
            ExecutionType::Branch | ExecutionType::Container
        )
    });
    for edge in graph.outgoing_edges(node_id) {
        if visited.contains(&edge.target) {
            continue;
        }
        if blocking {
            current.push(edge.index);
        }
        collect_paths(graph, &edge.target, target, visited, current, paths);
        if blocking {
            current.pop();
        }
    }
    visited.remove(node_id);
}
