use crate::variables::VariableMapping;
use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType};
use flowruntime::{NodeFactory, NodeMetadata};
use minijinja::Environment;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Longest output a template may produce
pub const MAX_OUTPUT_LENGTH: usize = 80_000;

#[derive(Debug, Deserialize)]
struct TemplateData {
    template: String,
    #[serde(default)]
    variables: Vec<VariableMapping>,
}

/// Renders a Jinja template over the mapped variables
pub struct TemplateTransformNode {
    env: Environment<'static>,
}

impl TemplateTransformNode {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        Self { env }
    }
}

impl Default for TemplateTransformNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for TemplateTransformNode {
    fn node_type(&self) -> NodeType {
        NodeType::TemplateTransform
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: TemplateData = ctx.data()?;
        let variables = VariableMapping::resolve_all(&data.variables, &ctx.variable_pool);
        let context: BTreeMap<&str, serde_json::Value> = variables
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_json()))
            .collect();

        let output = self
            .env
            .render_str(&data.template, context)
            .map_err(|e| NodeError::ExecutionFailed(format!("template render error: {}", e)))?;
        if output.chars().count() > MAX_OUTPUT_LENGTH {
            return Err(NodeError::ExecutionFailed(format!(
                "template output is longer than {} characters",
                MAX_OUTPUT_LENGTH
            )));
        }

        let mut result = NodeRunResult::new();
        result.inputs = variables;
        Ok(result.with_output("output", output))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        let data: TemplateData = config.decode_data().map_err(|e| {
            NodeError::Configuration(format!("template-transform node {}: {}", config.id, e))
        })?;
        self.env
            .template_from_str(&data.template)
            .map(|_| ())
            .map_err(|e| {
                NodeError::Configuration(format!("template-transform node {}: {}", config.id, e))
            })
    }
}

pub struct TemplateTransformNodeFactory;

impl NodeFactory for TemplateTransformNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(TemplateTransformNode::new()))
    }

    fn node_type(&self) -> NodeType {
        NodeType::TemplateTransform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Render a Jinja template".to_string(),
            category: "transform".to_string(),
            ..Default::default()
        }
    }
}
