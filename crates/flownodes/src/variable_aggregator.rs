use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, Value, VariablePool};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
struct Group {
    group_name: String,
    variables: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AdvancedSettings {
    #[serde(default)]
    group_enabled: bool,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Deserialize)]
struct AggregatorData {
    #[serde(default)]
    variables: Vec<Vec<String>>,
    #[serde(default)]
    advanced_settings: Option<AdvancedSettings>,
}

/// Merges alternative branches: outputs the first of its variables that
/// holds a value
pub struct VariableAggregatorNode;

fn first_present(selectors: &[Vec<String>], pool: &VariablePool) -> Value {
    selectors
        .iter()
        .filter_map(|selector| pool.get(selector))
        .find(|value| !value.is_null())
        .unwrap_or(Value::Null)
}

#[async_trait]
impl Node for VariableAggregatorNode {
    fn node_type(&self) -> NodeType {
        NodeType::VariableAggregator
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: AggregatorData = ctx.data()?;
        let pool = &ctx.variable_pool;

        match data.advanced_settings {
            Some(settings) if settings.group_enabled => {
                let mut result = NodeRunResult::new();
                for group in &settings.groups {
                    let output = BTreeMap::from([(
                        "output".to_string(),
                        first_present(&group.variables, pool),
                    )]);
                    result = result.with_output(group.group_name.clone(), Value::Object(output));
                }
                Ok(result)
            }
            _ => Ok(NodeRunResult::new().with_output("output", first_present(&data.variables, pool))),
        }
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        config
            .decode_data::<AggregatorData>()
            .map(|_| ())
            .map_err(|e| {
                NodeError::Configuration(format!("variable-aggregator node {}: {}", config.id, e))
            })
    }
}

pub struct VariableAggregatorNodeFactory;

impl NodeFactory for VariableAggregatorNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(VariableAggregatorNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::VariableAggregator
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pick the first available value among branches".to_string(),
            category: "data".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use serde_json::json;

    #[tokio::test]
    async fn takes_the_branch_that_ran() {
        let pool = VariablePool::new();
        pool.add(&["right", "text"], Value::from("from right")).unwrap();
        let config = NodeConfig::new("agg", NodeType::VariableAggregator)
            .with_data("variables", json!([["left", "text"], ["right", "text"]]));

        let result = VariableAggregatorNode.run(context(config, pool)).await.unwrap();
        assert_eq!(result.outputs["output"], Value::from("from right"));
    }

    #[tokio::test]
    async fn groups_produce_one_output_each() {
        let pool = VariablePool::new();
        pool.add(&["a", "text"], Value::from("x")).unwrap();
        let config = NodeConfig::new("agg", NodeType::VariableAggregator).with_data(
            "advanced_settings",
            json!({
                "group_enabled": true,
                "groups": [
                    { "group_name": "g1", "variables": [["a", "text"]] },
                    { "group_name": "g2", "variables": [["b", "text"]] }
                ]
            }),
        );

        let result = VariableAggregatorNode.run(context(config, pool)).await.unwrap();
        assert_eq!(result.outputs["g1"].get_path(&["output"]), Some(&Value::from("x")));
        assert_eq!(result.outputs["g2"].get_path(&["output"]), Some(&Value::Null));
    }
}
