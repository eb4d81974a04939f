//! Namespaced variable storage shared by every node of a run.
//!
//! Variables are addressed by a selector `[node_id, variable_name, ...path]`.
//! A pool is a stack of layers: the root layer belongs to the run, child
//! layers are pushed by loop and iteration scopes. Reads fall through to the
//! parent, writes always land in the layer that owns the key.

use crate::{FileValue, Value, VariableError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Namespace of system variables (`sys.user_id`, `sys.query`, ...)
pub const SYSTEM_VARIABLE_NODE_ID: &str = "sys";
/// Namespace of workflow environment variables
pub const ENVIRONMENT_VARIABLE_NODE_ID: &str = "env";
/// Namespace of conversation variables, writable through [`VariablePool::assign`]
pub const CONVERSATION_VARIABLE_NODE_ID: &str = "conversation";

type NodeVariables = BTreeMap<String, BTreeMap<String, Value>>;

/// Serializable contents of a pool, flattened across layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub variables: NodeVariables,
    #[serde(default)]
    pub user_inputs: BTreeMap<String, Value>,
}

/// Variables every run is seeded with under the `sys` namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemVariables {
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_run_id: Option<String>,
    pub conversation_id: Option<String>,
    pub query: Option<String>,
    #[serde(default)]
    pub files: Vec<FileValue>,
    pub dialogue_count: Option<u64>,
}

impl SystemVariables {
    fn into_values(self) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        let strings = [
            ("user_id", self.user_id),
            ("app_id", self.app_id),
            ("workflow_id", self.workflow_id),
            ("workflow_run_id", self.workflow_run_id),
            ("conversation_id", self.conversation_id),
            ("query", self.query),
        ];
        for (name, value) in strings {
            if let Some(value) = value {
                values.insert(name.to_string(), Value::String(value));
            }
        }
        values.insert(
            "files".to_string(),
            Value::Array(self.files.into_iter().map(Value::File).collect()),
        );
        if let Some(count) = self.dialogue_count {
            values.insert("dialogue_count".to_string(), Value::from(count));
        }
        values
    }
}

struct PoolLayer {
    variables: RwLock<NodeVariables>,
    user_inputs: RwLock<BTreeMap<String, Value>>,
    /// Node id whose variables this layer may update (loop scopes)
    owner: Option<String>,
    parent: Option<VariablePool>,
}

/// Handle to a layered variable pool. Cloning is cheap and shares storage.
#[derive(Clone)]
pub struct VariablePool {
    layer: Arc<PoolLayer>,
}

impl std::fmt::Debug for VariablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariablePool")
            .field("owner", &self.layer.owner)
            .field("depth", &self.depth())
            .finish()
    }
}

impl Default for VariablePool {
    fn default() -> Self {
        Self::new()
    }
}

impl VariablePool {
    pub fn new() -> Self {
        Self::from_layer(NodeVariables::new(), BTreeMap::new(), None, None)
    }

    fn from_layer(
        variables: NodeVariables,
        user_inputs: BTreeMap<String, Value>,
        owner: Option<String>,
        parent: Option<VariablePool>,
    ) -> Self {
        Self {
            layer: Arc::new(PoolLayer {
                variables: RwLock::new(variables),
                user_inputs: RwLock::new(user_inputs),
                owner,
                parent,
            }),
        }
    }

    /// Rebuild a root pool from a snapshot
    pub fn from_snapshot(snapshot: PoolSnapshot) -> Self {
        Self::from_layer(snapshot.variables, snapshot.user_inputs, None, None)
    }

    /// Seed the `sys` namespace
    pub fn with_system_variables(self, system: SystemVariables) -> Self {
        self.layer
            .variables
            .write()
            .entry(SYSTEM_VARIABLE_NODE_ID.to_string())
            .or_default()
            .extend(system.into_values());
        self
    }

    /// Seed the `env` namespace
    pub fn with_environment_variables(self, env: BTreeMap<String, Value>) -> Self {
        self.layer
            .variables
            .write()
            .entry(ENVIRONMENT_VARIABLE_NODE_ID.to_string())
            .or_default()
            .extend(env);
        self
    }

    /// Seed the `conversation` namespace
    pub fn with_conversation_variables(self, vars: BTreeMap<String, Value>) -> Self {
        self.layer
            .variables
            .write()
            .entry(CONVERSATION_VARIABLE_NODE_ID.to_string())
            .or_default()
            .extend(vars);
        self
    }

    /// Inputs supplied by the caller, read by the start node
    pub fn with_user_inputs(self, inputs: BTreeMap<String, Value>) -> Self {
        self.layer.user_inputs.write().extend(inputs);
        self
    }

    pub fn user_inputs(&self) -> BTreeMap<String, Value> {
        let mut inputs = match &self.layer.parent {
            Some(parent) => parent.user_inputs(),
            None => BTreeMap::new(),
        };
        inputs.extend(self.layer.user_inputs.read().clone());
        inputs
    }

    /// Push a child layer. With an `owner`, variables of that node id living
    /// in the new layer can be updated through [`assign`](Self::assign).
    pub fn child_scope(&self, owner: Option<&str>) -> VariablePool {
        Self::from_layer(
            NodeVariables::new(),
            BTreeMap::new(),
            owner.map(str::to_string),
            Some(self.clone()),
        )
    }

    pub fn owner(&self) -> Option<&str> {
        self.layer.owner.as_deref()
    }

    fn depth(&self) -> usize {
        match &self.layer.parent {
            Some(parent) => parent.depth() + 1,
            None => 0,
        }
    }

    /// Define `[node_id, name]` in this layer. Keys are write-once: defining
    /// a key this layer already holds fails.
    pub fn add<S: AsRef<str>>(&self, selector: &[S], value: Value) -> Result<(), VariableError> {
        let (node_id, name) = split_selector(selector)?;
        let mut variables = self.layer.variables.write();
        let slot = variables.entry(node_id.to_string()).or_default();
        if slot.contains_key(name) {
            return Err(VariableError::AlreadyDefined(selector_vec(selector)));
        }
        slot.insert(name.to_string(), value);
        Ok(())
    }

    /// Write every output of a finished node into this layer
    pub fn add_node_outputs(
        &self,
        node_id: &str,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<(), VariableError> {
        for (name, value) in outputs {
            self.add(&[node_id, name.as_str()], value.clone())?;
        }
        Ok(())
    }

    /// Resolve a selector, following nested paths past the variable name
    pub fn get<S: AsRef<str>>(&self, selector: &[S]) -> Option<Value> {
        if selector.len() < 2 {
            return None;
        }
        let node_id = selector[0].as_ref();
        let name = selector[1].as_ref();
        let found = {
            let variables = self.layer.variables.read();
            variables
                .get(node_id)
                .and_then(|vars| vars.get(name))
                .and_then(|value| value.get_path(&selector[2..]))
                .cloned()
        };
        match found {
            Some(value) => Some(value),
            None => self.layer.parent.as_ref().and_then(|p| p.get(selector)),
        }
    }

    pub fn contains<S: AsRef<str>>(&self, selector: &[S]) -> bool {
        self.get(selector).is_some()
    }

    /// All variables of one node, merged across layers
    pub fn node_variables(&self, node_id: &str) -> BTreeMap<String, Value> {
        let mut merged = match &self.layer.parent {
            Some(parent) => parent.node_variables(node_id),
            None => BTreeMap::new(),
        };
        if let Some(vars) = self.layer.variables.read().get(node_id) {
            merged.extend(vars.clone());
        }
        merged
    }

    /// Update an existing variable in place.
    ///
    /// Only conversation variables and variables owned by a loop scope are
    /// assignable; everything else, node outputs in particular, is read-only.
    pub fn assign<S: AsRef<str>>(&self, selector: &[S], value: Value) -> Result<(), VariableError> {
        let (node_id, name) = split_selector(selector)?;
        let mut current = Some(self);
        while let Some(pool) = current {
            let layer = &pool.layer;
            let mut variables = layer.variables.write();
            if let Some(slot) = variables.get_mut(node_id).and_then(|v| v.get_mut(name)) {
                let writable = node_id == CONVERSATION_VARIABLE_NODE_ID
                    || layer.owner.as_deref() == Some(node_id);
                if !writable {
                    return Err(VariableError::ReadOnly(selector_vec(selector)));
                }
                *slot = value;
                return Ok(());
            }
            current = layer.parent.as_ref();
        }
        Err(VariableError::NotFound(selector_vec(selector)))
    }

    /// Flattened copy of every layer, child layers shadowing parents
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = match &self.layer.parent {
            Some(parent) => parent.snapshot(),
            None => PoolSnapshot::default(),
        };
        for (node_id, vars) in self.layer.variables.read().iter() {
            snapshot
                .variables
                .entry(node_id.clone())
                .or_default()
                .extend(vars.clone());
        }
        snapshot
            .user_inputs
            .extend(self.layer.user_inputs.read().clone());
        snapshot
    }
}

fn split_selector<S: AsRef<str>>(selector: &[S]) -> Result<(&str, &str), VariableError> {
    match selector {
        [node_id, name] => Ok((node_id.as_ref(), name.as_ref())),
        _ => Err(VariableError::InvalidSelector(selector_vec(selector))),
    }
}

fn selector_vec<S: AsRef<str>>(selector: &[S]) -> Vec<String> {
    selector.iter().map(|s| s.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_outputs_are_write_once() {
        let pool = VariablePool::new();
        pool.add(&["llm", "text"], Value::from("hello")).unwrap();
        let err = pool.add(&["llm", "text"], Value::from("again")).unwrap_err();
        assert!(matches!(err, VariableError::AlreadyDefined(_)));
        assert_eq!(pool.get(&["llm", "text"]), Some(Value::from("hello")));
    }

    #[test]
    fn child_scope_reads_through_but_cannot_update_outer_outputs() {
        let root = VariablePool::new();
        root.add(&["start", "query"], Value::from("q")).unwrap();
        let child = root.child_scope(None);
        assert_eq!(child.get(&["start", "query"]), Some(Value::from("q")));

        let err = child.assign(&["start", "query"], Value::from("x")).unwrap_err();
        assert!(matches!(err, VariableError::ReadOnly(_)));
    }

    #[test]
    fn loop_scope_variables_are_assignable_from_nested_scopes() {
        let root = VariablePool::new();
        let loop_scope = root.child_scope(Some("loop1"));
        loop_scope.add(&["loop1", "count"], Value::from(0i64)).unwrap();

        let iteration = loop_scope.child_scope(None);
        iteration.assign(&["loop1", "count"], Value::from(1i64)).unwrap();
        assert_eq!(loop_scope.get(&["loop1", "count"]), Some(Value::from(1i64)));
        // nothing leaked into the root
        assert_eq!(root.get(&["loop1", "count"]), None);
    }

    #[test]
    fn conversation_variables_are_assignable() {
        let pool = VariablePool::new().with_conversation_variables(BTreeMap::from([(
            "memory".to_string(),
            Value::from("old"),
        )]));
        pool.assign(&[CONVERSATION_VARIABLE_NODE_ID, "memory"], Value::from("new"))
            .unwrap();
        assert_eq!(
            pool.get(&[CONVERSATION_VARIABLE_NODE_ID, "memory"]),
            Some(Value::from("new"))
        );
    }

    #[test]
    fn snapshot_round_trips() {
        let pool = VariablePool::new()
            .with_system_variables(SystemVariables {
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .with_user_inputs(BTreeMap::from([("name".to_string(), Value::from("ada"))]));
        pool.add(&["a", "out"], Value::from(1.5)).unwrap();

        let restored = VariablePool::from_snapshot(pool.snapshot());
        assert_eq!(restored.snapshot(), pool.snapshot());
        assert_eq!(restored.get(&["sys", "user_id"]), Some(Value::from("u1")));
    }
}
