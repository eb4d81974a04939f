use crate::variables::render_references;
use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, ResponseTemplate};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct AnswerData {
    answer: String,
}

/// Renders a piece of the chat answer. The engine streams the template's
/// pieces as their sources finish; answers from several nodes are
/// concatenated in completion order.
pub struct AnswerNode;

#[async_trait]
impl Node for AnswerNode {
    fn node_type(&self) -> NodeType {
        NodeType::Answer
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: AnswerData = ctx.data()?;
        let answer = render_references(&data.answer, &ctx.variable_pool);
        Ok(NodeRunResult::new()
            .with_input("template", data.answer)
            .with_output("answer", answer))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        config
            .decode_data::<AnswerData>()
            .map(|_| ())
            .map_err(|e| NodeError::Configuration(format!("answer node {}: {}", config.id, e)))
    }

    fn streaming_template(&self, config: &NodeConfig) -> Option<ResponseTemplate> {
        let data: AnswerData = config.decode_data().ok()?;
        Some(ResponseTemplate::parse(&data.answer))
    }
}

pub struct AnswerNodeFactory;

impl NodeFactory for AnswerNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(AnswerNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::Answer
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Render text into the chat answer".to_string(),
            category: "control".to_string(),
            ..Default::default()
        }
    }
}
