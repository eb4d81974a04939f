use flowcore::{Node, NodeConfig, NodeError, NodeType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a node instance for one graph node
    fn create(&self, config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError>;

    fn node_type(&self) -> NodeType;

    /// Optional: Get node metadata (description, inputs, outputs)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required,
        }
    }
}

type CreateFn = dyn Fn(&NodeConfig) -> Result<Arc<dyn Node>, NodeError> + Send + Sync;

struct FnFactory {
    node_type: NodeType,
    metadata: NodeMetadata,
    create: Box<CreateFn>,
}

impl NodeFactory for FnFactory {
    fn create(&self, config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        (self.create)(config)
    }

    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        self.metadata.clone()
    }
}

/// Lookup table from node type to constructor, filled before any graph is built
pub struct NodeRegistry {
    factories: BTreeMap<NodeType, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a node factory, replacing any previous one for the same type
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Register a constructor closure
    pub fn register_fn<F>(&mut self, node_type: NodeType, metadata: NodeMetadata, create: F)
    where
        F: Fn(&NodeConfig) -> Result<Arc<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            node_type,
            metadata,
            create: Box::new(create),
        }));
    }

    /// Create and validate the node for one graph node
    pub fn create_node(&self, config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        let factory = self.factories.get(&config.node_type).ok_or_else(|| {
            NodeError::Configuration(format!("Unknown node type: {}", config.node_type))
        })?;
        let node = factory.create(config)?;
        node.validate_config(config)?;
        Ok(node)
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.factories.contains_key(&node_type)
    }

    /// Get all registered node types
    pub fn list_node_types(&self) -> Vec<NodeType> {
        self.factories.keys().copied().collect()
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: NodeType) -> Option<NodeMetadata> {
        self.factories.get(&node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
