use crate::variables::VariableMapping;
use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct EndData {
    #[serde(default)]
    outputs: Vec<VariableMapping>,
}

/// Collects the selected variables into the run's final outputs
pub struct EndNode;

#[async_trait]
impl Node for EndNode {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: EndData = ctx.data()?;
        let outputs = VariableMapping::resolve_all(&data.outputs, &ctx.variable_pool);

        let mut result = NodeRunResult::new();
        result.inputs = outputs.clone();
        Ok(result.with_outputs(outputs))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        let data: EndData = config
            .decode_data()
            .map_err(|e| NodeError::Configuration(format!("end node {}: {}", config.id, e)))?;
        if let Some(bad) = data.outputs.iter().find(|m| m.value_selector.len() < 2) {
            return Err(NodeError::Configuration(format!(
                "end node {}: output {} needs a [node_id, variable] selector",
                config.id, bad.variable
            )));
        }
        Ok(())
    }
}

pub struct EndNodeFactory;

impl NodeFactory for EndNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(EndNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Expose selected variables as the workflow result".to_string(),
            category: "control".to_string(),
            inputs: vec![PortDefinition::new("outputs", "Variables to expose", false)],
            outputs: vec![],
        }
    }
}
