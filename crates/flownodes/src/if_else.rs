use async_trait::async_trait;
use flowcore::condition::{Condition, ConditionGroup, LogicalOperator};
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, Value};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::sync::Arc;

/// Handle taken when no case matches
pub const ELSE_HANDLE: &str = "false";

#[derive(Debug, Clone, Deserialize)]
struct Case {
    case_id: String,
    #[serde(flatten)]
    group: ConditionGroup,
}

#[derive(Debug, Deserialize)]
struct IfElseData {
    #[serde(default)]
    cases: Vec<Case>,
    /// Single-case form: `conditions` + `logical_operator` select the
    /// `true` handle
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    logical_operator: LogicalOperator,
}

impl IfElseData {
    fn into_cases(self) -> Vec<Case> {
        if !self.cases.is_empty() {
            return self.cases;
        }
        vec![Case {
            case_id: "true".to_string(),
            group: ConditionGroup {
                logical_operator: self.logical_operator,
                conditions: self.conditions,
            },
        }]
    }
}

/// Picks the first case whose conditions hold; its id becomes the branch
/// handle, `false` otherwise
pub struct IfElseNode;

#[async_trait]
impl Node for IfElseNode {
    fn node_type(&self) -> NodeType {
        NodeType::IfElse
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: IfElseData = ctx.data()?;
        let cases = data.into_cases();

        let selected = cases
            .iter()
            .find(|case| case.group.evaluate(&ctx.variable_pool))
            .map(|case| case.case_id.clone());
        let handle = selected.clone().unwrap_or_else(|| ELSE_HANDLE.to_string());
        tracing::debug!(node_id = %ctx.node_id, handle = %handle, "Branch selected");

        let mut result = NodeRunResult::new()
            .with_output("result", selected.is_some())
            .with_output("selected_case_id", handle.clone())
            .with_edge_source_handle(handle);
        for case in &cases {
            for condition in &case.group.conditions {
                let key = condition.variable_selector.join(".");
                let value = ctx
                    .variable_pool
                    .get(&condition.variable_selector)
                    .unwrap_or(Value::Null);
                result = result.with_input(key, value);
            }
        }
        Ok(result)
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        config
            .decode_data::<IfElseData>()
            .map(|_| ())
            .map_err(|e| NodeError::Configuration(format!("if-else node {}: {}", config.id, e)))
    }
}

pub struct IfElseNodeFactory;

impl NodeFactory for IfElseNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(IfElseNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::IfElse
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Route to the first matching case".to_string(),
            category: "logic".to_string(),
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

    fn scored(score: f64) -> VariablePool {
        let pool = VariablePool::new();
        pool.add(&["start", "score"], Value::from(score)).unwrap();
        pool
    }

    fn grading() -> NodeConfig {
        NodeConfig::new("grade", NodeType::IfElse).with_data(
            "cases",
            json!([
                {
                    "case_id": "high",
                    "logical_operator": "and",
                    "conditions": [{ "variable_selector": ["start", "score"], "comparison_operator": "≥", "value": 90 }]
                },
                {
                    "case_id": "pass",
                    "conditions": [{ "variable_selector": ["start", "score"], "comparison_operator": ">", "value": 50 }]
                }
            ]),
        )
    }

    #[tokio::test]
    async fn first_matching_case_wins() {
        let result = IfElseNode.run(context(grading(), scored(95.0))).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some("high"));

        let result = IfElseNode.run(context(grading(), scored(60.0))).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some("pass"));
    }

    #[tokio::test]
    async fn no_match_takes_the_else_handle() {
        let result = IfElseNode.run(context(grading(), scored(10.0))).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some(ELSE_HANDLE));
        assert_eq!(result.outputs["result"], Value::from(false));
    }

    #[tokio::test]
    async fn single_case_form_selects_true() {
        let config = NodeConfig::new("gate", NodeType::IfElse).with_data(
            "conditions",
            json!([{ "variable_selector": ["start", "score"], "comparison_operator": "<", "value": 5 }]),
        );
        let result = IfElseNode.run(context(config, scored(1.0))).await.unwrap();
        assert_eq!(result.edge_source_handle.as_deref(), Some("true"));
    }
}
