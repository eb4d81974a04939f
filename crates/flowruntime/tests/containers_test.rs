mod common;

use common::*;
use flowcore::{
    ErrorStrategy, GraphConfig, GraphEvent, NodeConfig, NodeExecutionStatus, NodeType, Value,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Loop `counter` whose body bumps `counter.count` once per round
fn counter_loop(max_iterations: usize, condition: Option<serde_json::Value>) -> NodeConfig {
    let body = GraphConfig::new()
        .with_node(NodeConfig::new("loop_start", NodeType::LoopStart))
        .with_node(
            NodeConfig::new("inc", NodeType::VariableAssigner)
                .with_data("increment", json!(["counter", "count"])),
        )
        .with_edge("loop_start", "inc");
    let mut node = NodeConfig::new("counter", NodeType::Loop)
        .with_data("max_iterations", json!(max_iterations))
        .with_data("variables", json!([{ "name": "count", "value": 0 }]))
        .with_body(body);
    if let Some(condition) = condition {
        node = node.with_data("condition", condition);
    }
    node
}

fn while_below(selector: &[&str], operator: &str, value: serde_json::Value) -> serde_json::Value {
    json!({
        "logical_operator": "and",
        "conditions": [{
            "variable_selector": selector,
            "comparison_operator": operator,
            "value": value,
        }]
    })
}

fn loop_graph(node: NodeConfig) -> GraphConfig {
    GraphConfig::new()
        .with_node(start())
        .with_node(node)
        .with_node(end("count", &["counter", "count"]))
        .with_edge("start", "counter")
        .with_edge("counter", "end")
}

#[tokio::test]
async fn loop_runs_while_condition_holds() {
    let (registry, log) = registry();
    let graph = build(
        &registry,
        &loop_graph(counter_loop(10, Some(while_below(&["counter", "count"], "<", json!(3))))),
    );

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunSucceeded { outputs, .. } => {
            assert_eq!(outputs["count"].as_f64(), Some(3.0));
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert_eq!(log.count("inc"), 3);

    let rounds: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::LoopNext { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![0, 1, 2]);

    let steps = events.iter().find_map(|e| match e {
        GraphEvent::LoopSucceeded { steps, .. } => Some(*steps),
        _ => None,
    });
    assert_eq!(steps, Some(3));
}

#[tokio::test]
async fn loop_without_condition_runs_every_round() {
    let (registry, log) = registry();
    let graph = build(&registry, &loop_graph(counter_loop(4, None)));

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    assert!(matches!(terminal(&events), GraphEvent::WorkflowRunSucceeded { .. }));
    assert_eq!(log.count("inc"), 4);
}

#[tokio::test]
async fn loop_that_never_settles_fails_the_run() {
    let (registry, log) = registry();
    let graph = build(
        &registry,
        &loop_graph(counter_loop(3, Some(while_below(&["counter", "index"], "≥", json!(0))))),
    );

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunFailed { error, node_id, .. } => {
            assert_eq!(node_id.as_deref(), Some("counter"));
            assert!(error.contains("did not finish"), "got {}", error);
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert_eq!(log.count("inc"), 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEvent::LoopFailed { steps: 3, .. })));
    assert_eq!(log.count("end"), 0);
}

#[tokio::test]
async fn loop_body_records_point_at_their_round() {
    let (registry, _) = registry();
    let graph = build(&registry, &loop_graph(counter_loop(2, None)));

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    let rounds: Vec<Option<usize>> = events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::NodeRunSucceeded { execution, .. } if execution.node_id == "inc" => {
                assert_eq!(execution.in_loop_id.as_deref(), Some("counter"));
                Some(execution.scope_index)
            }
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![Some(0), Some(1)]);
}

/// Iteration `iter` over `start.items` doubling each element
fn doubling(parallel: Option<usize>, body_extra: Option<NodeConfig>) -> NodeConfig {
    let mut body = GraphConfig::new()
        .with_node(NodeConfig::new("iteration_start", NodeType::IterationStart))
        .with_node(
            code("dbl")
                .with_data("double", json!(["iter", "item"]))
                .with_data("delay_from", json!(["iter", "item"])),
        )
        .with_edge("iteration_start", "dbl");
    if let Some(extra) = body_extra {
        let id = extra.id.clone();
        body = body.with_node(extra).with_edge("iteration_start", &id);
    }
    let mut node = NodeConfig::new("iter", NodeType::Iteration)
        .with_data("iterator_selector", json!(["start", "items"]))
        .with_data("output_selector", json!(["dbl", "value"]))
        .with_body(body);
    if let Some(parallel) = parallel {
        node = node
            .with_data("is_parallel", json!(true))
            .with_data("parallel_nums", json!(parallel));
    }
    node
}

fn iteration_graph(node: NodeConfig) -> GraphConfig {
    GraphConfig::new()
        .with_node(start())
        .with_node(node)
        .with_node(end("doubled", &["iter", "output"]))
        .with_edge("start", "iter")
        .with_edge("iter", "end")
}

fn items(values: serde_json::Value) -> BTreeMap<String, Value> {
    BTreeMap::from([("items".to_string(), Value::from_json(values))])
}

fn numbers(value: &Value) -> Vec<f64> {
    match value {
        Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
        other => panic!("expected an array, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn parallel_iteration_keeps_input_order() {
    let (registry, log) = registry();
    let graph = build(&registry, &iteration_graph(doubling(Some(4), None)));

    let events = harness(graph, items(json!([40, 5, 25, 1])), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunSucceeded { outputs, .. } => {
            assert_eq!(numbers(&outputs["doubled"]), vec![80.0, 10.0, 50.0, 2.0]);
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert_eq!(log.count("dbl"), 4);

    // every element starts before the slowest one finishes
    let last_next = events
        .iter()
        .rposition(|e| matches!(e, GraphEvent::IterationNext { .. }))
        .unwrap();
    let first_done = position(&events, |e| {
        matches!(e, GraphEvent::NodeRunSucceeded { execution, .. }
            if execution.node_id == "dbl" && execution.scope_index == Some(0))
    });
    assert!(last_next < first_done);
}

#[tokio::test]
async fn sequential_iteration_runs_one_element_at_a_time() {
    let (registry, _) = registry();
    let graph = build(&registry, &iteration_graph(doubling(None, None)));

    let events = harness(graph, items(json!([3, 1, 2])), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunSucceeded { outputs, .. } => {
            assert_eq!(numbers(&outputs["doubled"]), vec![6.0, 2.0, 4.0]);
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }

    let order: Vec<Option<usize>> = events
        .iter()
        .filter_map(|e| match e {
            GraphEvent::NodeRunSucceeded { execution, .. } if execution.node_id == "dbl" => {
                assert_eq!(execution.in_iteration_id.as_deref(), Some("iter"));
                Some(execution.scope_index)
            }
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn empty_iteration_yields_empty_output() {
    let (registry, log) = registry();
    let graph = build(&registry, &iteration_graph(doubling(None, None)));

    let events = harness(graph, items(json!([])), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunSucceeded { outputs, .. } => {
            assert_eq!(outputs["doubled"], Value::Array(Vec::new()));
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert_eq!(log.count("dbl"), 0);
}

#[tokio::test]
async fn iterating_a_non_array_fails() {
    let (registry, _) = registry();
    let graph = build(&registry, &iteration_graph(doubling(None, None)));

    let events = harness(graph, items(json!("not a list")), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunFailed { error, node_id, .. } => {
            assert_eq!(node_id.as_deref(), Some("iter"));
            assert!(error.contains("must be an array"), "got {}", error);
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
}

#[tokio::test]
async fn failing_element_fails_the_iteration() {
    let (registry, _) = registry();
    let graph = build(
        &registry,
        &iteration_graph(doubling(Some(2), Some(failing("broken", "bad element")))),
    );

    let events = harness(graph, items(json!([1, 2])), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunFailed { error, node_id, .. } => {
            assert_eq!(node_id.as_deref(), Some("iter"));
            assert!(error.contains("bad element"), "got {}", error);
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEvent::IterationFailed { node_id, .. } if node_id == "iter")));
}

#[tokio::test]
async fn iteration_error_strategy_keeps_the_run_going() {
    let (registry, log) = registry();
    let node = doubling(None, Some(failing("broken", "bad element")))
        .with_error_strategy(ErrorStrategy::ContinueOnError);
    let config = GraphConfig::new()
        .with_node(start())
        .with_node(node)
        .with_node(end("error", &["iter", "error_message"]))
        .with_edge("start", "iter")
        .with_edge("iter", "end");
    let graph = build(&registry, &config);

    let events = harness(graph, items(json!([1, 2, 3])), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    match terminal(&events) {
        GraphEvent::WorkflowRunSucceeded {
            outputs,
            exceptions_count,
            ..
        } => {
            assert_eq!(*exceptions_count, 1);
            assert!(outputs["error"].to_text().contains("bad element"));
        }
        other => panic!("unexpected terminal event {:?}", other.name()),
    }
    assert_eq!(finished_status(&events, "iter"), Some(NodeExecutionStatus::Failed));
    // sequential: the first element's failure stops the rest
    assert_eq!(log.count("broken"), 1);
}

#[tokio::test]
async fn loop_rounds_reuse_one_scope_slot() {
    let (registry, _) = registry();
    let graph = build(&registry, &loop_graph(counter_loop(25, None)));

    let execution = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .wait()
        .await
        .expect("coordinator finished");

    assert_eq!(execution.status(), flowruntime::ExecutionStatus::Succeeded);
    // root plus the round in flight
    assert_eq!(execution.scope_slots, 2);
}

#[tokio::test]
async fn iteration_scope_slots_follow_concurrency_not_item_count() {
    let (registry, log) = registry();
    let graph = build(&registry, &iteration_graph(doubling(Some(2), None)));
    let items = items(json!([1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]));

    let execution = harness(graph, items, fast_config())
        .engine
        .run()
        .wait()
        .await
        .expect("coordinator finished");

    assert_eq!(execution.status(), flowruntime::ExecutionStatus::Succeeded);
    assert_eq!(log.count("dbl"), 12);
    assert!(execution.scope_slots <= 3, "{} slots", execution.scope_slots);
}
