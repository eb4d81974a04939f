use flowcore::{ResponseTemplate, Value, VariablePool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binds a local name to a selector in the variable pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub variable: String,
    pub value_selector: Vec<String>,
}

impl VariableMapping {
    /// Resolve every mapping; unresolved selectors read as null
    pub fn resolve_all(mappings: &[VariableMapping], pool: &VariablePool) -> BTreeMap<String, Value> {
        mappings
            .iter()
            .map(|m| {
                let value = pool.get(&m.value_selector).unwrap_or(Value::Null);
                (m.variable.clone(), value)
            })
            .collect()
    }
}

/// Replace `{{#node.variable#}}` references with the text of the value they
/// point at. Missing variables render as empty text.
pub fn render_references(text: &str, pool: &VariablePool) -> String {
    ResponseTemplate::parse(text).render(pool)
}
