use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, Value};
use flowruntime::layers::UPDATED_VARIABLES;
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operation {
    #[serde(rename = "over-write", alias = "overwrite")]
    OverWrite,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "append")]
    Append,
    #[serde(rename = "extend")]
    Extend,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "+=")]
    Add,
    #[serde(rename = "-=")]
    Subtract,
    #[serde(rename = "*=")]
    Multiply,
    #[serde(rename = "/=")]
    Divide,
    #[serde(rename = "remove-first")]
    RemoveFirst,
    #[serde(rename = "remove-last")]
    RemoveLast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InputType {
    #[default]
    Variable,
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
struct AssignItem {
    variable_selector: Vec<String>,
    operation: Operation,
    #[serde(default)]
    input_type: InputType,
    /// A selector when `input_type` is `variable`, a literal otherwise
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AssignerData {
    items: Vec<AssignItem>,
}

/// Updates conversation and loop variables in place
pub struct VariableAssignerNode;

impl VariableAssignerNode {
    fn operand(item: &AssignItem, ctx: &NodeContext) -> Result<Value, NodeError> {
        match item.input_type {
            InputType::Constant => Ok(Value::from_json(item.value.clone())),
            InputType::Variable => {
                let selector: Vec<String> = serde_json::from_value(item.value.clone()).map_err(|_| {
                    NodeError::Configuration(format!(
                        "operand of {} must be a selector",
                        item.variable_selector.join(".")
                    ))
                })?;
                ctx.require_variable(&selector)
            }
        }
    }
}

/// Apply one operation to the current value of a variable
pub fn apply(operation: Operation, current: &Value, operand: Option<Value>) -> Result<Value, NodeError> {
    let mismatch = |expected: &str, actual: &Value| NodeError::InvalidInputType {
        field: format!("{:?}", operation),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    };
    let need = |operand: Option<Value>| {
        operand.ok_or_else(|| NodeError::Configuration(format!("{:?} needs a value", operation)))
    };

    match operation {
        Operation::OverWrite | Operation::Set => need(operand),
        Operation::Clear => Ok(match current {
            Value::String(_) => Value::String(String::new()),
            Value::Integer(_) => Value::Integer(0),
            Value::Float(_) => Value::Float(0.0),
            Value::Bool(_) => Value::Bool(false),
            Value::Array(_) => Value::Array(Vec::new()),
            Value::Object(_) => Value::Object(BTreeMap::new()),
            _ => Value::Null,
        }),
        Operation::Append => match current {
            Value::Array(items) => {
                let mut items = items.clone();
                items.push(need(operand)?);
                Ok(Value::Array(items))
            }
            other => Err(mismatch("array", other)),
        },
        Operation::Extend => match (current, need(operand)?) {
            (Value::Array(items), Value::Array(more)) => {
                let mut items = items.clone();
                items.extend(more);
                Ok(Value::Array(items))
            }
            (Value::Array(_), other) => Err(mismatch("array", &other)),
            (other, _) => Err(mismatch("array", other)),
        },
        Operation::RemoveFirst | Operation::RemoveLast => match current {
            Value::Array(items) => {
                let mut items = items.clone();
                if !items.is_empty() {
                    if operation == Operation::RemoveFirst {
                        items.remove(0);
                    } else {
                        items.pop();
                    }
                }
                Ok(Value::Array(items))
            }
            other => Err(mismatch("array", other)),
        },
        Operation::Add | Operation::Subtract | Operation::Multiply | Operation::Divide => {
            if !current.is_number() {
                return Err(mismatch("number", current));
            }
            let operand = need(operand)?;
            if !operand.is_number() {
                return Err(mismatch("number", &operand));
            }
            if let (Some(lhs), Some(rhs)) = (current.as_i64(), operand.as_i64()) {
                let exact = match operation {
                    Operation::Add => lhs.checked_add(rhs),
                    Operation::Subtract => lhs.checked_sub(rhs),
                    Operation::Multiply => lhs.checked_mul(rhs),
                    _ => None,
                };
                if let Some(value) = exact {
                    return Ok(Value::Integer(value));
                }
            }
            let lhs = current.as_f64().unwrap_or_default();
            let rhs = operand.as_f64().unwrap_or_default();
            let value = match operation {
                Operation::Add => lhs + rhs,
                Operation::Subtract => lhs - rhs,
                Operation::Multiply => lhs * rhs,
                _ if rhs == 0.0 => {
                    return Err(NodeError::ExecutionFailed("division by zero".to_string()))
                }
                _ => lhs / rhs,
            };
            if !value.is_finite() {
                return Err(NodeError::ExecutionFailed(format!(
                    "{:?} produced a non-finite result",
                    operation
                )));
            }
            Ok(Value::Float(value))
        }
    }
}

#[async_trait]
impl Node for VariableAssignerNode {
    fn node_type(&self) -> NodeType {
        NodeType::VariableAssigner
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: AssignerData = ctx.data()?;
        let mut updated = Vec::with_capacity(data.items.len());

        for item in &data.items {
            let current = ctx.require_variable(&item.variable_selector)?;
            let operand = match item.operation {
                Operation::Clear | Operation::RemoveFirst | Operation::RemoveLast => None,
                _ => Some(Self::operand(item, &ctx)?),
            };
            let value = apply(item.operation, &current, operand)?;
            ctx.variable_pool.assign(&item.variable_selector, value.clone())?;
            tracing::debug!(
                node_id = %ctx.node_id,
                selector = %item.variable_selector.join("."),
                operation = ?item.operation,
                "Variable updated"
            );

            let mut entry = BTreeMap::new();
            entry.insert(
                "selector".to_string(),
                Value::Array(item.variable_selector.iter().cloned().map(Value::from).collect()),
            );
            entry.insert("new_value".to_string(), value);
            updated.push(Value::Object(entry));
        }

        Ok(NodeRunResult::new().with_process_data(UPDATED_VARIABLES, Value::Array(updated)))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        config
            .decode_data::<AssignerData>()
            .map(|_| ())
            .map_err(|e| {
                NodeError::Configuration(format!("variable-assigner node {}: {}", config.id, e))
            })
    }
}

pub struct VariableAssignerNodeFactory;

impl NodeFactory for VariableAssignerNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(VariableAssignerNode))
    }

    fn node_type(&self) -> NodeType {
        NodeType::VariableAssigner
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Update conversation or loop variables".to_string(),
            category: "data".to_string(),
            ..Default::default()
        }
    }
}
