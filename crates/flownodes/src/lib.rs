//! Standard node library
//!
//! Built-in structural nodes so a workflow can run end to end without any
//! external node implementations.

mod answer;
mod end;
mod http;
mod if_else;
mod start;
mod template;
mod variable_aggregator;
mod variable_assigner;
mod variables;

pub use answer::AnswerNode;
pub use end::EndNode;
pub use http::HttpRequestNode;
pub use if_else::IfElseNode;
pub use start::{ScopeStartNode, StartNode};
pub use template::TemplateTransformNode;
pub use variable_aggregator::VariableAggregatorNode;
pub use variable_assigner::VariableAssignerNode;
pub use variables::{render_references, VariableMapping};

use flowruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(start::StartNodeFactory));
    registry.register(Arc::new(start::ScopeStartNodeFactory::loop_start()));
    registry.register(Arc::new(start::ScopeStartNodeFactory::iteration_start()));
    registry.register(Arc::new(end::EndNodeFactory));
    registry.register(Arc::new(answer::AnswerNodeFactory));
    registry.register(Arc::new(if_else::IfElseNodeFactory));
    registry.register(Arc::new(variable_assigner::VariableAssignerNodeFactory));
    registry.register(Arc::new(variable_aggregator::VariableAggregatorNodeFactory));
    registry.register(Arc::new(template::TemplateTransformNodeFactory));
    registry.register(Arc::new(http::HttpRequestNodeFactory));
}

/// Registry holding every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
