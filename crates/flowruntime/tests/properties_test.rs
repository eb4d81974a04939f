mod common;

use common::*;
use flowcore::{GraphConfig, GraphEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

fn finished_at(events: &[GraphEvent], node_id: &str) -> usize {
    position(events, |e| {
        matches!(e, GraphEvent::NodeRunSucceeded { execution, .. } if execution.node_id == node_id)
    })
}

fn started_at(events: &[GraphEvent], node_id: &str) -> usize {
    position(events, |e| {
        matches!(e, GraphEvent::NodeRunStarted { execution, .. } if execution.node_id == node_id)
    })
}

#[tokio::test]
async fn random_dags_never_start_a_node_before_its_predecessors() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..8 {
        let size = rng.gen_range(4..12);
        let ids: Vec<String> = (0..size)
            .map(|i| if i == 0 { "start".to_string() } else { format!("n{}", i) })
            .collect();

        let mut config = GraphConfig::new().with_node(start());
        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); size];
        for i in 1..size {
            config = config.with_node(slow(&ids[i], rng.gen_range(0..15)));
            let first = rng.gen_range(0..i);
            parents[i].push(first);
            for candidate in 0..i {
                if candidate != first && rng.gen_bool(0.3) {
                    parents[i].push(candidate);
                }
            }
        }
        for (child, sources) in parents.iter().enumerate() {
            for &parent in sources {
                config = config.with_edge(&ids[parent], &ids[child]);
            }
        }

        let (registry, log) = registry();
        let graph = build(&registry, &config);
        let events = harness(graph, BTreeMap::new(), fast_config())
            .engine
            .run()
            .collect_events()
            .await;

        assert!(matches!(terminal(&events), GraphEvent::WorkflowRunSucceeded { .. }));
        for (child, sources) in parents.iter().enumerate() {
            assert_eq!(log.count(&ids[child]), 1, "{} ran more than once", ids[child]);
            let started = started_at(&events, &ids[child]);
            for &parent in sources {
                assert!(
                    finished_at(&events, &ids[parent]) < started,
                    "{} started before {} finished",
                    ids[child],
                    ids[parent]
                );
            }
        }
    }
}

#[tokio::test]
async fn diamond_schedules_the_join_once() {
    let (registry, log) = registry();
    let config = GraphConfig::new()
        .with_node(start())
        .with_node(slow("a", 10))
        .with_node(slow("b", 10))
        .with_node(code("d"))
        .with_node(end("d", &["a", "output"]))
        .with_edge("start", "a")
        .with_edge("start", "b")
        .with_edge("a", "d")
        .with_edge("b", "d")
        .with_edge("d", "end");
    let graph = build(&registry, &config);

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    assert!(matches!(terminal(&events), GraphEvent::WorkflowRunSucceeded { .. }));
    for node in ["start", "a", "b", "d", "end"] {
        assert_eq!(log.count(node), 1, "{} ran {} times", node, log.count(node));
    }
}

#[tokio::test]
async fn skipped_branch_cascades_but_join_still_runs() {
    let (registry, log) = registry();
    // gate picks x; y and everything only reachable through y is skipped,
    // while join still runs off the taken x edge
    let config = GraphConfig::new()
        .with_node(start())
        .with_node(branch("gate", "x"))
        .with_node(code("x"))
        .with_node(code("y"))
        .with_node(code("y2"))
        .with_node(code("only_y"))
        .with_node(code("join"))
        .with_edge("start", "gate")
        .with_branch_edge("gate", "x", "x")
        .with_branch_edge("gate", "y", "y")
        .with_edge("y", "y2")
        .with_edge("y2", "only_y")
        .with_edge("y2", "join")
        .with_edge("x", "join");
    let graph = build(&registry, &config);

    let harness = harness(graph, BTreeMap::new(), fast_config());
    let state = harness.state.clone();
    let events = harness.engine.run().collect_events().await;

    assert!(matches!(terminal(&events), GraphEvent::WorkflowRunSucceeded { .. }));
    assert_eq!(log.count("join"), 1);
    for skipped in ["y", "y2", "only_y"] {
        assert_eq!(log.count(skipped), 0);
    }

    let saved = state.execution_state().expect("final scheduling state");
    let mut skipped = saved.skipped_nodes.clone();
    skipped.sort();
    assert_eq!(skipped, vec!["only_y", "y", "y2"]);
    assert!(saved.executed_nodes.contains(&"join".to_string()));
}

#[tokio::test]
async fn node_with_every_input_skipped_never_runs() {
    let (registry, log) = registry();
    let config = GraphConfig::new()
        .with_node(start())
        .with_node(branch("gate", "left"))
        .with_node(code("left"))
        .with_node(code("right_a"))
        .with_node(code("right_b"))
        .with_node(code("right_join"))
        .with_edge("start", "gate")
        .with_branch_edge("gate", "left", "left")
        .with_branch_edge("gate", "right", "right_a")
        .with_branch_edge("gate", "right", "right_b")
        .with_edge("right_a", "right_join")
        .with_edge("right_b", "right_join");
    let graph = build(&registry, &config);

    let events = harness(graph, BTreeMap::new(), fast_config())
        .engine
        .run()
        .collect_events()
        .await;

    assert!(matches!(terminal(&events), GraphEvent::WorkflowRunSucceeded { .. }));
    assert_eq!(log.count("left"), 1);
    assert_eq!(log.count("right_join"), 0);
    assert!(!started_nodes(&events).contains(&"right_join".to_string()));
}
