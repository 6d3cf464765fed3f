mod common;

use common::{engine, registry, FlakyStore};
use relaycore::{
    EventKind, Graph, GraphValidationError, NodeId, NodeKind, NodeSpec, NodeStatus, RunStatus,
    END_NODE,
};
use relayengine::{EngineError, RuntimeConfig, WorkflowEngine};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn custom(id: &str) -> NodeSpec {
    NodeSpec::new(id, NodeKind::Custom)
}

fn tool(id: &str, handler: &str) -> NodeSpec {
    NodeSpec::new(id, NodeKind::Tool).with_handler(handler)
}

/// start -> grade, grade -[continue]-> generate, grade -[end]-> END
fn grading_graph(verdict: &str) -> Graph {
    let mut graph = Graph::new("grading");
    graph.add_node(custom("start").with_config("output", json!({ "ready": true })));
    graph.add_node(
        custom("grade")
            .with_branches(["continue", "end"])
            .with_config("branch", verdict)
            .with_config("output", json!({ "verdict": verdict })),
    );
    graph.add_node(custom("generate").with_config("output", json!({ "text": "paragraph" })));
    graph.connect("start", "grade");
    graph.connect_when("grade", "continue", "generate");
    graph.connect_when("grade", "end", END_NODE);
    graph
}

async fn status_of(engine: &WorkflowEngine, run_id: relaycore::RunId, node: &str) -> Option<NodeStatus> {
    engine
        .list_node_states(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.node_id.as_str() == node)
        .map(|s| s.status)
}

#[tokio::test]
async fn test_end_branch_leaves_generate_untouched() {
    let config = RuntimeConfig {
        record_bypassed_branches: false,
        ..RuntimeConfig::default()
    };
    let (engine, _) = engine(0, config);
    let graph = grading_graph("end");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({ "topic": "rust" })).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({ "verdict": "end" })));
    assert_eq!(status_of(&engine, run.run_id, "start").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "grade").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "generate").await, None);
}

#[tokio::test]
async fn test_bypassed_branch_recorded_as_skipped() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let graph = grading_graph("end");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(status_of(&engine, run.run_id, "generate").await, Some(NodeStatus::Skipped));
    let summary = run.summary.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn test_continue_branch_runs_generate() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let graph = grading_graph("continue");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({ "text": "paragraph" })));
    assert_eq!(run.last_message.as_deref(), Some("Completed 3 nodes"));
}

#[tokio::test]
async fn test_retry_until_success() {
    let (engine, steps) = engine(2, RuntimeConfig::default());
    let mut graph = Graph::new("retry");
    graph.add_node(tool("fetch", "flaky").with_retry(3, 10));
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let events = engine.subscribe(run_id);
    let status = engine.execute(run_id).await.unwrap();
    let events = events.collect().await;

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(steps.flaky.calls.load(Ordering::SeqCst), 3);

    let states = engine.list_node_states(run_id).await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, NodeStatus::Completed);
    assert_eq!(states[0].attempts, 3);
    assert_eq!(states[0].error_history.len(), 2);

    let retries: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::NodeProgress)
        .filter_map(|e| e.payload["attempt"].as_u64())
        .collect();
    assert_eq!(retries, vec![2, 3]);
}

#[tokio::test]
async fn test_retry_budget_exhausted_fails_run() {
    let (engine, steps) = engine(10, RuntimeConfig::default());
    let mut graph = Graph::new("exhausted");
    graph.add_node(tool("fetch", "flaky").with_retry(3, 1));
    graph.add_node(custom("after"));
    graph.connect("fetch", "after");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_node, Some(NodeId::from("fetch")));
    assert!(run.last_message.unwrap().contains("fetch"));
    assert_eq!(steps.flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(status_of(&engine, run.run_id, "fetch").await, Some(NodeStatus::Failed));
    assert_eq!(status_of(&engine, run.run_id, "after").await, None);
}

#[tokio::test]
async fn test_failure_skips_queued_nodes() {
    let config = RuntimeConfig {
        max_parallel_nodes: 1,
        ..RuntimeConfig::default()
    };
    let (engine, _) = engine(0, config);
    let mut graph = Graph::new("fail-fast");
    graph.add_node(custom("a"));
    graph.add_node(tool("b", "fail"));
    graph.add_node(custom("c"));
    graph.connect("a", "b");
    graph.connect("a", "c");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_node, Some(NodeId::from("b")));
    assert_eq!(status_of(&engine, run.run_id, "c").await, Some(NodeStatus::Skipped));
    let summary = run.summary.unwrap();
    assert_eq!((summary.completed, summary.failed, summary.skipped), (1, 1, 1));
}

#[tokio::test]
async fn test_error_edge_recovers() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("recover");
    graph.add_node(tool("b", "fail"));
    graph.add_node(custom("handler").with_config("from", "b.error_kind"));
    graph.add_node(custom("happy"));
    graph.connect("b", "happy");
    graph.connect_on_error("b", "handler");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("execution")));
    assert_eq!(status_of(&engine, run.run_id, "b").await, Some(NodeStatus::Failed));
    assert_eq!(status_of(&engine, run.run_id, "handler").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "happy").await, None);
}

#[tokio::test]
async fn test_cancel_lets_running_node_finish() {
    let (engine, steps) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("cancel");
    graph.add_node(tool("a", "sleep").with_config("sleep_ms", 200));
    graph.add_node(custom("b"));
    graph.connect("a", "b");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let mut events = engine.subscribe(run_id);
    let handle = engine.spawn(run_id);

    while let Some(event) = events.recv().await {
        if event.kind == EventKind::NodeStarted {
            break;
        }
    }
    assert!(engine.cancel(run_id).await.unwrap());
    assert!(engine.is_cancel_requested(run_id));

    let status = handle.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(steps.sleep.calls.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&engine, run_id, "a").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run_id, "b").await, None);

    let run = engine.get_run(run_id).await.unwrap();
    assert!(run.last_message.unwrap().starts_with("Cancelled"));
    assert!(!engine.cancel(run_id).await.unwrap());
}

/// Cancel a single quiet node once it started; returns the run and node status.
async fn cancel_quiet_node(fail: bool) -> (RunStatus, Option<NodeStatus>, Vec<EventKind>) {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("quiet");
    graph.add_node(
        tool("work", "quiet")
            .with_config("sleep_ms", 100)
            .with_config("fail", fail),
    );
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let mut events = engine.subscribe(run_id);
    let handle = engine.spawn(run_id);

    while let Some(event) = events.recv().await {
        if event.kind == EventKind::NodeStarted {
            break;
        }
    }
    assert!(engine.cancel(run_id).await.unwrap());

    let status = handle.await.unwrap().unwrap();
    let tail = events.collect().await.iter().map(|e| e.kind).collect();
    (status, status_of(&engine, run_id, "work").await, tail)
}

#[tokio::test]
async fn test_cancel_last_running_node_ends_cancelled() {
    for _ in 0..5 {
        let (status, node, tail) = cancel_quiet_node(false).await;
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(node, Some(NodeStatus::Completed));
        assert_eq!(tail, vec![EventKind::NodeCompleted, EventKind::RunCancelled]);
    }
}

#[tokio::test]
async fn test_cancel_last_failing_node_ends_cancelled() {
    for _ in 0..5 {
        let (status, node, tail) = cancel_quiet_node(true).await;
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(node, Some(NodeStatus::Failed));
        assert_eq!(tail, vec![EventKind::NodeFailed, EventKind::RunCancelled]);
    }
}

#[tokio::test]
async fn test_cancel_during_retry_delay() {
    let (engine, _) = engine(10, RuntimeConfig::default());
    let mut graph = Graph::new("cancel-retry");
    graph.add_node(tool("fetch", "flaky").with_retry(5, 10_000));
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let mut events = engine.subscribe(run_id);
    let handle = engine.spawn(run_id);

    while let Some(event) = events.recv().await {
        if event.kind == EventKind::NodeProgress {
            break;
        }
    }
    engine.cancel(run_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(status_of(&engine, run_id, "fetch").await, Some(NodeStatus::Cancelled));

    let tail: Vec<EventKind> = events.collect().await.iter().map(|e| e.kind).collect();
    assert_eq!(tail, vec![EventKind::NodeCancelled, EventKind::RunCancelled]);
}

#[tokio::test]
async fn test_cancel_before_execute() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let graph = grading_graph("end");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    engine.cancel(run_id).await.unwrap();

    assert_eq!(engine.execute(run_id).await.unwrap(), RunStatus::Cancelled);
    assert_eq!(status_of(&engine, run_id, "start").await, Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_finished_runs_release_bookkeeping() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let graph = grading_graph("continue");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let cancelled = engine.create_run(graph_id, json!({})).await.unwrap();
    engine.cancel(cancelled).await.unwrap();
    assert_eq!(engine.cancellation_count(), 1);
    assert_eq!(engine.execute(cancelled).await.unwrap(), RunStatus::Cancelled);

    let completed = engine.run(graph_id, json!({})).await.unwrap();
    assert_eq!(completed.status, RunStatus::Completed);

    assert_eq!(engine.cancellation_count(), 0);
    assert_eq!(engine.events().tracked_runs(), 0);
}

#[tokio::test]
async fn test_execute_is_idempotent() {
    let (engine, steps) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("once");
    graph.add_node(tool("a", "sleep").with_config("sleep_ms", 30));
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let first = engine.spawn(run_id);
    let second = engine.spawn(run_id);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(engine.execute(run_id).await.unwrap(), RunStatus::Completed);
    assert_eq!(steps.sleep.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_event_order() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("events");
    graph.add_node(tool("a", "sleep").with_config("sleep_ms", 10));
    graph.add_node(custom("b"));
    graph.connect("a", "b");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let mut all = engine.subscribe_all();
    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let events = engine.subscribe(run_id);
    engine.execute(run_id).await.unwrap();
    let events = events.collect().await;

    assert_eq!(all.recv().await.unwrap().kind, EventKind::RunCreated);

    let kinds: Vec<(EventKind, Option<&str>)> = events
        .iter()
        .map(|e| (e.kind, e.node_id.as_ref().map(NodeId::as_str)))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EventKind::RunStarted, None),
            (EventKind::NodeStarted, Some("a")),
            (EventKind::NodeProgress, Some("a")),
            (EventKind::NodeCompleted, Some("a")),
            (EventKind::NodeStarted, Some("b")),
            (EventKind::NodeCompleted, Some("b")),
            (EventKind::RunCompleted, None),
        ]
    );
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(events[2].payload["message"], "halfway");
}

#[tokio::test]
async fn test_timeout_fails_node() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("slow");
    graph.add_node(
        tool("slow", "sleep")
            .with_config("sleep_ms", 2_000)
            .with_timeout_ms(50),
    );
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let events = engine.subscribe(run_id);
    let status = engine.execute(run_id).await.unwrap();
    let events = events.collect().await;

    assert_eq!(status, RunStatus::Failed);
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::NodeFailed)
        .unwrap();
    assert_eq!(failed.payload["error_kind"], "timeout");
}

#[tokio::test]
async fn test_panicking_step_fails_node() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("panic");
    graph.add_node(tool("p", "panic"));
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_message.unwrap().contains("step blew up"));
}

#[tokio::test]
async fn test_store_failure_halts_run() {
    common::init_tracing();
    let (registry, _) = registry(0);
    let engine = WorkflowEngine::with_store(
        registry,
        Arc::new(FlakyStore::new("b")),
        RuntimeConfig::default(),
    );
    let mut graph = Graph::new("fatal");
    graph.add_node(custom("a"));
    graph.add_node(custom("b"));
    graph.connect("a", "b");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let err = engine.execute(run_id).await.unwrap_err();

    assert!(err.is_fatal());
    let run = engine.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(status_of(&engine, run_id, "a").await, Some(NodeStatus::Completed));

    let run = engine.abandon(run_id, "store unavailable").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(engine.cancellation_count(), 0);
    assert_eq!(engine.events().tracked_runs(), 0);
}

#[tokio::test]
async fn test_fan_out_and_fan_in() {
    let (engine, steps) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("diamond");
    graph.add_node(custom("a"));
    graph.add_node(tool("b", "sleep").with_config("sleep_ms", 80));
    graph.add_node(tool("c", "sleep").with_config("sleep_ms", 20));
    graph.add_node(tool("d", "sleep").with_config("sleep_ms", 1));
    graph.connect("a", "b");
    graph.connect("a", "c");
    graph.connect("b", "d");
    graph.connect("c", "d");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(steps.sleep.calls.load(Ordering::SeqCst), 3);
    assert_eq!(steps.sleep.max_concurrent.load(Ordering::SeqCst), 2);
    let order = steps.sleep.order.lock().unwrap().clone();
    assert_eq!(order, vec!["c", "b", "d"]);
    assert_eq!(run.output, Some(json!({ "slept_ms": 1 })));
}

/// route selects `a` and `b`; each label has its own target.
fn multi_branch_graph() -> Graph {
    let mut graph = Graph::new("multi-branch");
    graph.add_node(
        custom("route")
            .with_branches(["a", "b", "c"])
            .with_config("branch", json!(["a", "b"])),
    );
    for (label, target) in [("a", "x"), ("b", "y"), ("c", "z")] {
        graph.add_node(custom(target).with_config("output", json!({ "via": label })));
        graph.connect_when("route", label, target);
    }
    graph
}

#[tokio::test]
async fn test_all_selected_branches_fire() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let graph = multi_branch_graph();
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(status_of(&engine, run.run_id, "x").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "y").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "z").await, Some(NodeStatus::Skipped));
    assert_eq!(
        run.output,
        Some(json!({ "x": { "via": "a" }, "y": { "via": "b" } }))
    );
}

#[tokio::test]
async fn test_unselected_branch_absent_without_bypass_records() {
    let config = RuntimeConfig {
        record_bypassed_branches: false,
        ..RuntimeConfig::default()
    };
    let (engine, _) = engine(0, config);
    let graph = multi_branch_graph();
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(status_of(&engine, run.run_id, "x").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "y").await, Some(NodeStatus::Completed));
    assert_eq!(status_of(&engine, run.run_id, "z").await, None);
}

#[tokio::test]
async fn test_parallelism_limit() {
    let config = RuntimeConfig {
        max_parallel_nodes: 1,
        ..RuntimeConfig::default()
    };
    let (engine, steps) = engine(0, config);
    let mut graph = Graph::new("wide");
    graph.add_node(custom("root"));
    for id in ["x", "y", "z"] {
        graph.add_node(tool(id, "sleep").with_config("sleep_ms", 10));
        graph.connect("root", id);
    }
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run = engine.run(graph_id, json!({})).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(steps.sleep.max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(*steps.sleep.order.lock().unwrap(), vec!["x", "y", "z"]);
    let output = run.output.unwrap();
    assert_eq!(output.as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_unknown_capability_rejected() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("unknown");
    graph.add_node(tool("t", "nope"));

    let err = engine.register_graph(graph).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(GraphValidationError::UnknownCapability { .. })
    ));
}

#[tokio::test]
async fn test_missing_graph_and_run() {
    let (engine, _) = engine(0, RuntimeConfig::default());

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        engine.create_run(missing, json!({})).await,
        Err(EngineError::GraphNotFound(_))
    ));
    assert!(matches!(
        engine.get_run(missing).await,
        Err(EngineError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_runs_pin_graph_version() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = grading_graph("end");
    let graph_id = graph.id;
    engine.register_graph(graph.clone()).await.unwrap();
    let old_run = engine.create_run(graph_id, json!({})).await.unwrap();

    graph.nodes[1].config["branch"] = json!("continue");
    graph.bump_version();
    engine.register_graph(graph).await.unwrap();
    let new_run = engine.create_run(graph_id, json!({})).await.unwrap();

    assert_eq!(engine.get_run(old_run).await.unwrap().graph_version, 1);
    assert_eq!(engine.get_run(new_run).await.unwrap().graph_version, 2);
    assert_eq!(engine.execute(new_run).await.unwrap(), RunStatus::Completed);
    assert_eq!(
        status_of(&engine, new_run, "generate").await,
        Some(NodeStatus::Completed)
    );
    assert_eq!(engine.plans().len(), 2);
    assert_eq!(engine.list_runs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_wait_for_spawned_run() {
    let (engine, _) = engine(0, RuntimeConfig::default());
    let mut graph = Graph::new("background");
    graph.add_node(tool("a", "sleep").with_config("sleep_ms", 30));
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let run_id = engine.create_run(graph_id, json!({})).await.unwrap();
    let _handle = engine.spawn(run_id);

    let run = engine.wait(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());

    // Already terminal: returns immediately
    assert_eq!(engine.wait(run_id).await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_wait_survives_dropped_terminal_event() {
    let config = RuntimeConfig {
        event_buffer_size: 2,
        ..RuntimeConfig::default()
    };
    let (engine, _) = engine(0, config);
    let graph = grading_graph("continue");
    let graph_id = graph.id;
    engine.register_graph(graph).await.unwrap();

    let first = engine.create_run(graph_id, json!({})).await.unwrap();
    let wait = engine.wait(first);
    tokio::pin!(wait);
    assert!(futures::poll!(&mut wait).is_pending());

    // The second run pushes the first run's terminal event out of the buffer
    assert_eq!(engine.execute(first).await.unwrap(), RunStatus::Completed);
    engine.run(graph_id, json!({})).await.unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait returned")
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}
