use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, Value};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::sync::Arc;

/// Declared input of a workflow
#[derive(Debug, Clone, Deserialize)]
struct InputVariable {
    variable: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StartData {
    #[serde(default)]
    variables: Vec<InputVariable>,
}

/// Entry node: publishes the user inputs as its outputs
pub struct StartNode;

#[async_trait]
impl Node for StartNode {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: StartData = ctx.data()?;
        let mut inputs = ctx.variable_pool.user_inputs();

        for declared in &data.variables {
            let present = inputs.get(&declared.variable).is_some_and(|v| !v.is_null());
            if present {
                continue;
            }
            match &declared.default {
                Some(default) => {
                    inputs.insert(declared.variable.clone(), Value::from_json(default.clone()));
                }
                None if declared.required => {
                    return Err(NodeError::MissingInput(declared.variable.clone()));
                }
                None => {}
            }
        }

        Ok(NodeRunResult::new().with_outputs(inputs))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        config
            .decode_data::<StartData>()
            .map(|_| ())
            .map_err(|e| NodeError::Configuration(format!("start node {}: {}", config.id, e)))
    }
}

pub struct StartNodeFactory;

impl NodeFactory for StartNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(StartNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Publish the workflow inputs".to_string(),
            category: "control".to_string(),
            ..Default::default()
        }
    }
}

/// Root marker of a loop or iteration body. Does nothing; its outgoing
/// edges are all taken.
pub struct ScopeStartNode {
    node_type: NodeType,
}

#[async_trait]
impl Node for ScopeStartNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    async fn run(&self, _ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        Ok(NodeRunResult::new())
    }
}

pub struct ScopeStartNodeFactory {
    node_type: NodeType,
}

impl ScopeStartNodeFactory {
    pub fn loop_start() -> Self {
        Self {
            node_type: NodeType::LoopStart,
        }
    }

    pub fn iteration_start() -> Self {
        Self {
            node_type: NodeType::IterationStart,
        }
    }
}

impl NodeFactory for ScopeStartNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(ScopeStartNode {
            node_type: self.node_type,
        }))
    }

    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Entry point of a container body".to_string(),
            category: "control".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use flowcore::VariablePool;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn defaults_fill_missing_inputs() {
        let pool = VariablePool::new().with_user_inputs(BTreeMap::from([(
            "query".to_string(),
            Value::from("hi"),
        )]));
        let config = NodeConfig::new("start", NodeType::Start).with_data(
            "variables",
            json!([
                { "variable": "query", "required": true },
                { "variable": "lang", "default": "en" },
                { "variable": "extra" }
            ]),
        );

        let result = StartNode.run(context(config, pool)).await.unwrap();
        assert_eq!(result.outputs["query"], Value::from("hi"));
        assert_eq!(result.outputs["lang"], Value::from("en"));
        assert!(!result.outputs.contains_key("extra"));
    }

    #[tokio::test]
    async fn missing_required_input_fails() {
        let config = NodeConfig::new("start", NodeType::Start)
            .with_data("variables", json!([{ "variable": "query", "required": true }]));
        let err = StartNode.run(context(config, VariablePool::new())).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingInput(name) if name == "query"));
    }
}
