//! Immutable graph built from a [`GraphConfig`].
//!
//! A `Graph` holds node instances, edges with their branch labels and
//! precomputed adjacency. It carries no per-run state and is shared through an
//! `Arc` by every run (and every loop round) that executes it.

use crate::registry::NodeRegistry;
use flowcore::condition::ConditionGroup;
use flowcore::{
    ExecutionType, GraphConfig, Node, NodeConfig, NodeError, NodeId, NodeType,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphValidationError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("No root node: {0}")]
    MissingRoot(String),

    #[error("Node {0} is not reachable from the root")]
    Unreachable(NodeId),

    #[error("Cycle detected at node {0}")]
    Cycle(NodeId),

    #[error("Container {node_id} is invalid: {reason}")]
    InvalidContainer { node_id: NodeId, reason: String },

    #[error("Failed to create node {node_id}: {source}")]
    NodeCreation {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },
}

/// Edge with its position in the graph's edge list
#[derive(Debug, Clone)]
pub struct Edge {
    pub index: usize,
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: String,
}

/// How the engine runs a node
pub enum NodeKind {
    Executable(Arc<dyn Node>),
    Loop(LoopSpec),
    Iteration(IterationSpec),
}

pub struct GraphNode {
    pub config: Arc<NodeConfig>,
    pub kind: NodeKind,
}

impl GraphNode {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type
    }

    pub fn execution_type(&self) -> ExecutionType {
        self.config.node_type.execution_type()
    }
}

/// Initial value of a loop variable: a constant or a selector read when the
/// loop starts
#[derive(Debug, Clone, Deserialize)]
pub struct LoopVariable {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub value_selector: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct LoopData {
    #[serde(alias = "loop_count")]
    max_iterations: usize,
    #[serde(default)]
    condition: Option<ConditionGroup>,
    #[serde(default, alias = "loop_variables")]
    variables: Vec<LoopVariable>,
    #[serde(default)]
    start_node_id: Option<NodeId>,
}

#[derive(Deserialize)]
struct IterationData {
    iterator_selector: Vec<String>,
    output_selector: Vec<String>,
    #[serde(default)]
    is_parallel: bool,
    #[serde(default = "default_parallel_nums")]
    parallel_nums: usize,
    #[serde(default)]
    start_node_id: Option<NodeId>,
}

fn default_parallel_nums() -> usize {
    10
}

pub struct LoopSpec {
    pub body: Arc<Graph>,
    pub max_iterations: usize,
    /// Loop keeps going while this holds
    pub condition: Option<ConditionGroup>,
    pub variables: Vec<LoopVariable>,
}

pub struct IterationSpec {
    pub body: Arc<Graph>,
    pub iterator_selector: Vec<String>,
    pub output_selector: Vec<String>,
    /// Number of elements allowed to run at once
    pub concurrency: usize,
}

pub struct Graph {
    nodes: Vec<GraphNode>,
    node_index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    root: usize,
    topo_order: Vec<usize>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("root", &self.root_id())
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

impl Graph {
    pub fn build(config: &GraphConfig, registry: &NodeRegistry) -> Result<Graph, GraphValidationError> {
        Self::build_scoped(config, registry, None)
    }

    fn build_scoped(
        config: &GraphConfig,
        registry: &NodeRegistry,
        preferred_root: Option<&str>,
    ) -> Result<Graph, GraphValidationError> {
        if config.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }

        let mut node_index = HashMap::new();
        for (i, node) in config.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(GraphValidationError::DuplicateNode(node.id.clone()));
            }
        }

        let mut edges = Vec::with_capacity(config.edges.len());
        let mut incoming = vec![Vec::new(); config.nodes.len()];
        let mut outgoing = vec![Vec::new(); config.nodes.len()];
        for (index, edge) in config.edges.iter().enumerate() {
            let lookup = |id: &NodeId| {
                node_index
                    .get(id)
                    .copied()
                    .ok_or_else(|| GraphValidationError::DanglingEdge {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        missing: id.clone(),
                    })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;
            outgoing[source].push(index);
            incoming[target].push(index);
            edges.push(Edge {
                index,
                source: edge.source.clone(),
                target: edge.target.clone(),
                source_handle: edge.source_handle.clone(),
            });
        }

        let root = select_root(config, &node_index, &incoming, preferred_root)?;

        let mut dag = DiGraph::<usize, ()>::new();
        let indices: Vec<NodeIndex> = (0..config.nodes.len()).map(|i| dag.add_node(i)).collect();
        for edge in &edges {
            dag.add_edge(
                indices[node_index[&edge.source]],
                indices[node_index[&edge.target]],
                (),
            );
        }
        if let Err(cycle) = petgraph::algo::toposort(&dag, None) {
            let at = dag[cycle.node_id()];
            return Err(GraphValidationError::Cycle(config.nodes[at].id.clone()));
        }

        let mut reached = vec![false; config.nodes.len()];
        let mut dfs = Dfs::new(&dag, indices[root]);
        while let Some(visited) = dfs.next(&dag) {
            reached[dag[visited]] = true;
        }
        if let Some(i) = reached.iter().position(|r| !r) {
            return Err(GraphValidationError::Unreachable(config.nodes[i].id.clone()));
        }

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for node_config in &config.nodes {
            let kind = build_kind(node_config, registry)?;
            nodes.push(GraphNode {
                config: Arc::new(node_config.clone()),
                kind,
            });
        }

        let topo_order = declaration_ordered_toposort(&incoming, &outgoing, &edges, &node_index);

        tracing::debug!(
            root = %config.nodes[root].id,
            nodes = nodes.len(),
            edges = edges.len(),
            "Graph built"
        );

        Ok(Graph {
            nodes,
            node_index,
            edges,
            incoming,
            outgoing,
            root,
            topo_order,
        })
    }

    pub fn root_id(&self) -> &str {
        self.nodes[self.root].id()
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.node_index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_index.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> Option<&Edge> {
        self.edges.get(index)
    }

    pub fn incoming_edges(&self, node_id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.adjacent(&self.incoming, node_id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.adjacent(&self.outgoing, node_id)
    }

    fn adjacent<'a>(
        &'a self,
        table: &'a [Vec<usize>],
        node_id: &str,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        let list: &'a [usize] = match self.node_index.get(node_id) {
            Some(&i) => &table[i],
            None => &[],
        };
        list.iter().map(move |&e| &self.edges[e])
    }

    /// Nodes in topological order, ties broken by declaration order.
    /// Each call starts a fresh traversal.
    pub fn walk_nodes(&self) -> impl Iterator<Item = (&str, &GraphNode)> + '_ {
        self.topo_order.iter().map(move |&i| {
            let node = &self.nodes[i];
            (node.id(), node)
        })
    }
}

fn select_root(
    config: &GraphConfig,
    node_index: &HashMap<NodeId, usize>,
    incoming: &[Vec<usize>],
    preferred: Option<&str>,
) -> Result<usize, GraphValidationError> {
    if let Some(id) = config.root_node_id.as_deref().or(preferred) {
        return node_index
            .get(id)
            .copied()
            .ok_or_else(|| {
                GraphValidationError::MissingRoot(format!("root node {} does not exist", id))
            });
    }

    let entry = |i: &usize| incoming[*i].is_empty();
    let declared = 0..config.nodes.len();
    declared
        .clone()
        .filter(entry)
        .find(|&i| config.nodes[i].node_type.execution_type() == ExecutionType::Root)
        .or_else(|| declared.clone().find(entry))
        .ok_or_else(|| {
            GraphValidationError::MissingRoot("every node has incoming edges".to_string())
        })
}

fn build_kind(config: &NodeConfig, registry: &NodeRegistry) -> Result<NodeKind, GraphValidationError> {
    let invalid = |reason: String| GraphValidationError::InvalidContainer {
        node_id: config.id.clone(),
        reason,
    };

    match config.node_type {
        NodeType::Loop => {
            let data: LoopData = config.decode_data().map_err(|e| invalid(e.to_string()))?;
            let body = container_body(config, registry, data.start_node_id.as_deref())?;
            Ok(NodeKind::Loop(LoopSpec {
                body,
                max_iterations: data.max_iterations,
                condition: data.condition,
                variables: data.variables,
            }))
        }
        NodeType::Iteration => {
            let data: IterationData = config.decode_data().map_err(|e| invalid(e.to_string()))?;
            if data.iterator_selector.len() < 2 || data.output_selector.len() < 2 {
                return Err(invalid("selectors need a node id and a variable name".to_string()));
            }
            let body = container_body(config, registry, data.start_node_id.as_deref())?;
            let concurrency = if data.is_parallel {
                data.parallel_nums.max(1)
            } else {
                1
            };
            Ok(NodeKind::Iteration(IterationSpec {
                body,
                iterator_selector: data.iterator_selector,
                output_selector: data.output_selector,
                concurrency,
            }))
        }
        _ => registry
            .create_node(config)
            .map(NodeKind::Executable)
            .map_err(|source| GraphValidationError::NodeCreation {
                node_id: config.id.clone(),
                source,
            }),
    }
}

fn container_body(
    config: &NodeConfig,
    registry: &NodeRegistry,
    start_node_id: Option<&str>,
) -> Result<Arc<Graph>, GraphValidationError> {
    let body = config
        .body
        .as_deref()
        .ok_or_else(|| GraphValidationError::InvalidContainer {
            node_id: config.id.clone(),
            reason: "missing body graph".to_string(),
        })?;
    Graph::build_scoped(body, registry, start_node_id).map(Arc::new)
}

/// Kahn's algorithm picking the earliest declared ready node first
fn declaration_ordered_toposort(
    incoming: &[Vec<usize>],
    outgoing: &[Vec<usize>],
    edges: &[Edge],
    node_index: &HashMap<NodeId, usize>,
) -> Vec<usize> {
    let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(incoming.len());
    while let Some(Reverse(i)) = heap.pop() {
        order.push(i);
        for &e in &outgoing[i] {
            let target = node_index[&edges[e].target];
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                heap.push(Reverse(target));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcore::{NodeContext, NodeRunResult};
    use serde_json::json;

    struct Noop(NodeType);

    #[async_trait]
    impl Node for Noop {
        fn node_type(&self) -> NodeType {
            self.0
        }

        async fn run(&self, _ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
            Ok(NodeRunResult::new())
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for node_type in [NodeType::Start, NodeType::Code, NodeType::End, NodeType::LoopStart] {
            registry.register_fn(node_type, Default::default(), move |_| {
                Ok(Arc::new(Noop(node_type)) as Arc<dyn Node>)
            });
        }
        registry
    }

    fn node(id: &str, node_type: NodeType) -> NodeConfig {
        NodeConfig::new(id, node_type)
    }

    #[test]
    fn rejects_dangling_edges() {
        let config = GraphConfig::new()
            .with_node(node("start", NodeType::Start))
            .with_edge("start", "ghost");
        let err = Graph::build(&config, &registry()).unwrap_err();
        assert!(matches!(err, GraphValidationError::DanglingEdge { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn rejects_cycles_and_unreachable_nodes() {
        let cyclic = GraphConfig::new()
            .with_node(node("start", NodeType::Start))
            .with_node(node("a", NodeType::Code))
            .with_node(node("b", NodeType::Code))
            .with_edge("start", "a")
            .with_edge("a", "b")
            .with_edge("b", "a");
        assert!(matches!(
            Graph::build(&cyclic, &registry()),
            Err(GraphValidationError::Cycle(_))
        ));

        let island = GraphConfig::new()
            .with_node(node("start", NodeType::Start))
            .with_node(node("a", NodeType::Code))
            .with_node(node("lonely", NodeType::Code))
            .with_edge("start", "a")
            .with_edge("lonely", "a");
        assert!(matches!(
            Graph::build(&island, &registry()),
            Err(GraphValidationError::Unreachable(id)) if id == "lonely"
        ));
    }

    #[test]
    fn unknown_node_type_fails_at_build() {
        let config = GraphConfig::new().with_node(node("llm", NodeType::Llm));
        assert!(matches!(
            Graph::build(&config, &registry()),
            Err(GraphValidationError::NodeCreation { .. })
        ));
    }

    #[test]
    fn walk_is_topological_with_declaration_tie_break() {
        let config = GraphConfig::new()
            .with_node(node("end", NodeType::End))
            .with_node(node("b", NodeType::Code))
            .with_node(node("a", NodeType::Code))
            .with_node(node("start", NodeType::Start))
            .with_edge("start", "a")
            .with_edge("start", "b")
            .with_edge("a", "end")
            .with_edge("b", "end");
        let graph = Graph::build(&config, &registry()).unwrap();

        assert_eq!(graph.root_id(), "start");
        let order: Vec<&str> = graph.walk_nodes().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["start", "b", "a", "end"]);
        // restartable
        assert_eq!(graph.walk_nodes().count(), 4);
        assert_eq!(graph.incoming_edges("end").count(), 2);
        assert_eq!(graph.outgoing_edges("start").count(), 2);
    }

    #[test]
    fn loop_body_is_built_as_its_own_graph() {
        let body = GraphConfig::new()
            .with_node(node("loop_start", NodeType::LoopStart))
            .with_node(node("step", NodeType::Code))
            .with_edge("loop_start", "step");
        let config = GraphConfig::new()
            .with_node(node("start", NodeType::Start))
            .with_node(
                node("loop", NodeType::Loop)
                    .with_data("max_iterations", json!(3))
                    .with_body(body),
            )
            .with_edge("start", "loop");

        let graph = Graph::build(&config, &registry()).unwrap();
        match &graph.node("loop").unwrap().kind {
            NodeKind::Loop(spec) => {
                assert_eq!(spec.max_iterations, 3);
                assert_eq!(spec.body.root_id(), "loop_start");
            }
            _ => panic!("expected loop container"),
        }
    }

    #[test]
    fn container_without_body_is_rejected() {
        let config = GraphConfig::new()
            .with_node(node("start", NodeType::Start))
            .with_node(node("loop", NodeType::Loop).with_data("max_iterations", json!(1)))
            .with_edge("start", "loop");
        assert!(matches!(
            Graph::build(&config, &registry()),
            Err(GraphValidationError::InvalidContainer { .. })
        ));
    }
}
