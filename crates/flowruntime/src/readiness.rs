//! Per-scope edge state and node readiness.

use crate::graph::Graph;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeState {
    #[default]
    Unknown,
    Taken,
    Skipped,
}

/// Summary of a node's incoming edges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeAnalysis {
    pub has_unknown: bool,
    pub has_taken: bool,
    pub all_skipped: bool,
}

/// Write-once edge states for one execution scope
#[derive(Debug, Clone)]
pub struct EdgeStateTracker {
    states: Vec<EdgeState>,
}

impl EdgeStateTracker {
    pub fn new(graph: &Graph) -> Self {
        Self {
            states: vec![EdgeState::Unknown; graph.edges().len()],
        }
    }

    /// Rebuild from stored states; the length must match the graph
    pub fn from_states(graph: &Graph, states: Vec<EdgeState>) -> Option<Self> {
        (states.len() == graph.edges().len()).then_some(Self { states })
    }

    pub fn state(&self, edge: usize) -> EdgeState {
        self.states.get(edge).copied().unwrap_or_default()
    }

    pub fn states(&self) -> &[EdgeState] {
        &self.states
    }

    /// Resolve an UNKNOWN edge as TAKEN. Returns false if it was already resolved.
    pub fn mark_taken(&mut self, edge: usize) -> bool {
        self.resolve(edge, EdgeState::Taken)
    }

    /// Resolve an UNKNOWN edge as SKIPPED. Returns false if it was already resolved.
    pub fn mark_skipped(&mut self, edge: usize) -> bool {
        self.resolve(edge, EdgeState::Skipped)
    }

    fn resolve(&mut self, edge: usize, to: EdgeState) -> bool {
        match self.states.get_mut(edge) {
            Some(state) if *state == EdgeState::Unknown => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    pub fn analyze(&self, graph: &Graph, node_id: &str) -> EdgeAnalysis {
        let mut analysis = EdgeAnalysis {
            all_skipped: true,
            ..Default::default()
        };
        let mut any = false;
        for edge in graph.incoming_edges(node_id) {
            any = true;
            match self.state(edge.index) {
                EdgeState::Unknown => analysis.has_unknown = true,
                EdgeState::Taken => analysis.has_taken = true,
                EdgeState::Skipped => {}
            }
            if self.state(edge.index) != EdgeState::Skipped {
                analysis.all_skipped = false;
            }
        }
        if !any {
            analysis.all_skipped = false;
        }
        analysis
    }
}

/// Readiness decisions over one graph and one scope's edge states
pub struct ReadinessChecker<'a> {
    graph: &'a Graph,
    edges: &'a EdgeStateTracker,
}

impl<'a> ReadinessChecker<'a> {
    pub fn new(graph: &'a Graph, edges: &'a EdgeStateTracker) -> Self {
        Self { graph, edges }
    }

    /// A node without incoming edges is always ready. Otherwise it is ready
    /// once no incoming edge is UNKNOWN and at least one is TAKEN.
    pub fn is_node_ready(&self, node_id: &str) -> bool {
        let analysis = self.edges.analyze(self.graph, node_id);
        if self.graph.incoming_edges(node_id).next().is_none() {
            return true;
        }
        !analysis.has_unknown && analysis.has_taken
    }

    /// Distinct ready targets of TAKEN outgoing edges, in edge order
    pub fn get_ready_downstream_nodes(&self, from_node_id: &str) -> Vec<String> {
        let mut ready: Vec<String> = Vec::new();
        for edge in self.graph.outgoing_edges(from_node_id) {
            if self.edges.state(edge.index) != EdgeState::Taken {
                continue;
            }
            if ready.iter().any(|id| id == &edge.target) {
                continue;
            }
            if self.is_node_ready(&edge.target) {
                ready.push(edge.target.clone());
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use async_trait::async_trait;
    use flowcore::{GraphConfig, Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType};
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl Node for Noop {
        fn node_type(&self) -> NodeType {
            NodeType::Code
        }

        async fn run(&self, _ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
            Ok(NodeRunResult::new())
        }
    }

    fn diamond() -> Graph {
        let mut registry = NodeRegistry::new();
        registry.register_fn(NodeType::Code, Default::default(), |_| Ok(Arc::new(Noop) as Arc<dyn Node>));
        let config = GraphConfig::new()
            .with_node(NodeConfig::new("s", NodeType::Code))
            .with_node(NodeConfig::new("a", NodeType::Code))
            .with_node(NodeConfig::new("b", NodeType::Code))
            .with_node(NodeConfig::new("join", NodeType::Code))
            .with_edge("s", "a")
            .with_edge("s", "b")
            .with_edge("a", "join")
            .with_edge("b", "join");
        Graph::build(&config, &registry).unwrap()
    }

    #[test]
    fn edges_are_write_once() {
        let graph = diamond();
        let mut edges = EdgeStateTracker::new(&graph);
        assert!(edges.mark_taken(0));
        assert!(!edges.mark_skipped(0));
        assert_eq!(edges.state(0), EdgeState::Taken);
    }

    #[test]
    fn join_waits_for_every_branch_to_resolve() {
        let graph = diamond();
        let mut edges = EdgeStateTracker::new(&graph);
        assert!(ReadinessChecker::new(&graph, &edges).is_node_ready("s"));

        edges.mark_taken(2); // a -> join
        assert!(!ReadinessChecker::new(&graph, &edges).is_node_ready("join"));
        assert!(ReadinessChecker::new(&graph, &edges)
            .get_ready_downstream_nodes("a")
            .is_empty());

        edges.mark_skipped(3); // b -> join
        let checker = ReadinessChecker::new(&graph, &edges);
        assert!(checker.is_node_ready("join"));
        assert_eq!(checker.get_ready_downstream_nodes("a"), vec!["join".to_string()]);
    }

    #[test]
    fn all_skipped_node_is_not_ready() {
        let graph = diamond();
        let mut edges = EdgeStateTracker::new(&graph);
        edges.mark_skipped(2);
        edges.mark_skipped(3);
        assert!(!ReadinessChecker::new(&graph, &edges).is_node_ready("join"));
        assert!(edges.analyze(&graph, "join").all_skipped);
    }
}
