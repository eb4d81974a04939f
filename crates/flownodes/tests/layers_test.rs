use flowcore::{NodeExecution, RunId, SystemVariables, Value, WorkflowConfig};
use flownodes::standard_registry;
use flowruntime::layers::{
    ConversationVariableLayer, ConversationVariableUpdater, ExecutionRepository, PersistenceLayer,
};
use flowruntime::{run_outputs, FlowRuntime, RuntimeConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const TRIAGE: &str = include_str!("fixtures/support_triage.json");

#[derive(Default)]
struct MemoryRepository {
    records: Mutex<Vec<NodeExecution>>,
    snapshots: Mutex<Vec<RunId>>,
}

impl ExecutionRepository for MemoryRepository {
    fn on_node_finished(&self, record: &NodeExecution) {
        self.records.lock().unwrap().push(record.clone());
    }

    fn on_run_paused(&self, run_id: RunId, _snapshot: &str) {
        self.snapshots.lock().unwrap().push(run_id);
    }
}

#[derive(Clone, Default)]
struct RecordingUpdater {
    updates: Arc<Mutex<Vec<(Option<String>, String, Value)>>>,
    flushes: Arc<Mutex<usize>>,
}

impl ConversationVariableUpdater for RecordingUpdater {
    fn update(&self, conversation_id: Option<&str>, name: &str, value: &Value) {
        self.updates.lock().unwrap().push((
            conversation_id.map(str::to_string),
            name.to_string(),
            value.clone(),
        ));
    }

    fn flush(&self) {
        *self.flushes.lock().unwrap() += 1;
    }
}

#[tokio::test]
async fn layers_see_records_and_conversation_updates() {
    let workflow: WorkflowConfig = serde_json::from_str(TRIAGE).unwrap();
    let runtime = FlowRuntime::with_registry(Arc::new(standard_registry()), RuntimeConfig::default());

    let inputs = BTreeMap::from([
        ("customer".to_string(), Value::from("Grace")),
        ("tickets".to_string(), Value::from_json(json!(["a", "b", "c"]))),
    ]);
    let system = SystemVariables {
        conversation_id: Some("conv-7".to_string()),
        ..Default::default()
    };
    let state = Arc::new(runtime.initial_state(&workflow, inputs, system));
    let graph = runtime.build_graph(&workflow.graph).unwrap();

    let repository = Arc::new(MemoryRepository::default());
    let updater = RecordingUpdater::default();
    let run = runtime
        .engine(graph, state)
        .layer(PersistenceLayer::new(repository.clone()))
        .layer(ConversationVariableLayer::new(Box::new(updater.clone())))
        .run();

    let outputs = run_outputs(run).await.unwrap();
    assert_eq!(outputs["greeting"], Value::from("Hello Grace"));

    let records = repository.records.lock().unwrap();
    assert!(records.iter().any(|r| r.node_id == "count_greeting"));
    assert!(!records.iter().any(|r| r.node_id == "answer_urgent"));
    let formatted: Vec<_> = records.iter().filter(|r| r.node_id == "fmt").collect();
    assert_eq!(formatted.len(), 3);
    assert!(formatted
        .iter()
        .all(|r| r.in_iteration_id.as_deref() == Some("each")));
    assert!(repository.snapshots.lock().unwrap().is_empty());

    // loop variable writes by `bump` are not conversation variables
    let updates = updater.updates.lock().unwrap();
    assert_eq!(
        *updates,
        vec![(Some("conv-7".to_string()), "greetings".to_string(), Value::from(1.0))]
    );
    assert_eq!(*updater.flushes.lock().unwrap(), 1);
}
