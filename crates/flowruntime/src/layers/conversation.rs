use super::Layer;
use crate::state::RuntimeState;
use flowcore::variable_pool::{CONVERSATION_VARIABLE_NODE_ID, SYSTEM_VARIABLE_NODE_ID};
use flowcore::{GraphEvent, NodeType, Value};

/// `process_data` key under which the variable assigner lists what it
/// updated, one `{"selector": [..], "new_value": ..}` object per write
pub const UPDATED_VARIABLES: &str = "updated_variables";

/// Durable store for conversation variables.
///
/// Implementations buffer under their own lock; `flush` is called once when
/// the run ends.
pub trait ConversationVariableUpdater: Send + Sync {
    fn update(&self, conversation_id: Option<&str>, name: &str, value: &Value);

    fn flush(&self);
}

/// Pushes conversation variables changed by variable assigners to a
/// [`ConversationVariableUpdater`]
pub struct ConversationVariableLayer {
    updater: Box<dyn ConversationVariableUpdater>,
}

impl ConversationVariableLayer {
    pub fn new(updater: Box<dyn ConversationVariableUpdater>) -> Self {
        Self { updater }
    }
}

impl Layer for ConversationVariableLayer {
    fn name(&self) -> &str {
        "conversation_variables"
    }

    fn on_event(&mut self, event: &GraphEvent, state: &RuntimeState) {
        let GraphEvent::NodeRunSucceeded { execution, .. } = event else {
            return;
        };
        if execution.node_type != NodeType::VariableAssigner {
            return;
        }
        let Some(Value::Array(selectors)) = execution.process_data.get(UPDATED_VARIABLES) else {
            return;
        };

        let pool = state.variable_pool();
        let conversation_id = pool
            .get(&[SYSTEM_VARIABLE_NODE_ID, "conversation_id"])
            .and_then(|v| v.as_str().map(str::to_string));

        for entry in selectors {
            let Value::Object(entry) = entry else {
                continue;
            };
            let Some(parts) = entry.get("selector").and_then(Value::as_array) else {
                continue;
            };
            let parts: Vec<String> = parts.iter().map(Value::to_text).collect();
            if parts.len() != 2 || parts[0] != CONVERSATION_VARIABLE_NODE_ID {
                continue;
            }
            if let Some(value) = pool.get(&parts) {
                tracing::debug!(name = %parts[1], "Persisting conversation variable");
                self.updater
                    .update(conversation_id.as_deref(), &parts[1], &value);
            }
        }
    }

    fn on_graph_end(&mut self, _error: Option<&str>, _state: &RuntimeState) {
        self.updater.flush();
    }
}
