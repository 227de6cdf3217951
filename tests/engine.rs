//! End-to-end runs of straight-line and branching workflows.

mod common;

use std::sync::Arc;

use serde_json::json;

use blockrunner::error::StructuralError;
use blockrunner::{
    Block, CancelHandle, Engine, EngineError, HandlerRegistry, RunRequest, RunStatus,
    WorkflowDefinition,
};
use common::{Tracker, TripHandler};

fn start() -> Block {
    Block::new("start", "starter").with_name("Start")
}

#[tokio::test]
async fn test_linear_reference_passing() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("linear")
        .with_block(start())
        .with_block(Block::new("twice", "double").with_config(json!({"value": "<start.n>"})))
        .with_block(
            Block::new("reply", "response")
                .with_config(json!({"data": {"result": "<twice>", "text": "got <twice>"}})),
        )
        .connect("start", "twice")
        .connect("twice", "reply");

    let workflow = engine.load(def).unwrap();
    let result = engine
        .execute(workflow, RunRequest::new().with_input(json!({"n": 21})))
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, json!({"result": 42, "text": "got 42"}));
    assert_eq!(result.metadata.executed_block_count, 3);
    assert_eq!(result.logs.len(), 3);
}

#[tokio::test]
async fn test_diamond_runs_each_block_once() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("diamond")
        .with_block(start())
        .with_block(Block::new("a", "count").with_config(json!({"side": "a"})))
        .with_block(Block::new("b", "count").with_config(json!({"side": "b"})))
        .with_block(
            Block::new("join", "count").with_config(json!({"left": "<a.side>", "right": "<b.side>"})),
        )
        .connect("start", "a")
        .connect("start", "b")
        .connect("a", "join")
        .connect("b", "join");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(result.success);
    for id in ["a", "b", "join"] {
        assert_eq!(tracker.runs(id), 1, "{} should run exactly once", id);
        assert_eq!(result.logs_for(id).count(), 1);
    }
    assert_eq!(result.executed_blocks, vec!["a", "b", "join", "start"]);
    assert_eq!(result.output, json!({"left": "a", "right": "b"}));
}

#[tokio::test]
async fn test_condition_routes_and_skips_other_branch() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("branching")
        .with_block(start())
        .with_block(Block::new("check", "condition").with_config(json!({
            "conditions": [
                {"id": "high", "expression": "<start.score> > 5"},
                {"id": "low", "expression": "else"}
            ]
        })))
        .with_block(Block::new("high", "count").with_config(json!({"branch": "high"})))
        .with_block(Block::new("low", "count").with_config(json!({"branch": "low"})))
        .with_block(Block::new("after_low", "count"))
        .with_block(Block::new("done", "response").with_config(json!({"data": "<high.branch>"})))
        .connect("start", "check")
        .connect_handle("check", "condition-high", "high")
        .connect_handle("check", "condition-low", "low")
        .connect("low", "after_low")
        .connect("high", "done")
        .connect("after_low", "done");

    let workflow = engine.load(def).unwrap();
    let result = engine
        .execute(Arc::clone(&workflow), RunRequest::new().with_input(json!({"score": 7})))
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, json!("high"));
    assert_eq!(result.skipped_blocks, vec!["after_low", "low"]);
    assert_eq!(tracker.runs("low"), 0);
    assert_eq!(tracker.runs("after_low"), 0);
    assert_eq!(result.logs_for("done").count(), 1);

    let result = engine
        .execute(workflow, RunRequest::new().with_input(json!({"score": 2})))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.skipped_blocks, vec!["high"]);
    assert_eq!(tracker.runs("after_low"), 1);
    assert_eq!(result.output, json!(null));
}

#[tokio::test]
async fn test_condition_on_values_with_operator_characters() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("labels")
        .with_block(start())
        .with_block(Block::new("check", "condition").with_config(json!({
            "conditions": [
                {"id": "yes", "expression": "<start.label> == 'R&&D'"},
                {"id": "no", "expression": "else"}
            ]
        })))
        .with_block(Block::new("yes", "response").with_config(json!({"data": "yes"})))
        .with_block(Block::new("no", "response").with_config(json!({"data": "no"})))
        .connect("start", "check")
        .connect_handle("check", "condition-yes", "yes")
        .connect_handle("check", "condition-no", "no");
    let workflow = engine.load(def).unwrap();

    for (label, expected) in [("R&&D", "yes"), ("R || D", "no"), ("x > y", "no")] {
        let result = engine
            .execute(
                Arc::clone(&workflow),
                RunRequest::new().with_input(json!({"label": label})),
            )
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!(expected), "label {:?}", label);
    }
}

#[tokio::test]
async fn test_disabled_block_is_bypassed() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("disabled")
        .with_block(start())
        .with_block(Block::new("mid", "count").disabled())
        .with_block(Block::new("end", "response").with_config(json!({
            "data": {"raw": "<mid.value>", "text": "mid=<mid.value>"}
        })))
        .connect("start", "mid")
        .connect("mid", "end");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(tracker.runs("mid"), 0);
    assert!(!result.executed_blocks.contains(&"mid".to_string()));
    assert_eq!(result.output, json!({"raw": null, "text": "mid="}));
}

#[tokio::test]
async fn test_unreachable_block_never_runs() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("orphan")
        .with_block(start())
        .with_block(Block::new("main", "count"))
        .with_block(Block::new("orphan", "count"))
        .connect("start", "main");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(tracker.runs("orphan"), 0);
    assert_eq!(result.executed_blocks, vec!["main", "start"]);
}

#[tokio::test]
async fn test_environment_and_variables() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("env")
        .with_block(start())
        .with_block(
            Block::new("set", "variables").with_config(json!({"assignments": {"count": 3}})),
        )
        .with_block(Block::new("reply", "response").with_config(json!({
            "data": {"key": "Bearer {{API_KEY}}", "count": "<variable.count>", "seed": "<variable.seed>"}
        })))
        .connect("start", "set")
        .connect("set", "reply");

    let request = RunRequest::new()
        .with_env("API_KEY", "secret")
        .with_variable("seed", json!("abc"));
    let result = engine
        .execute(engine.load(def).unwrap(), request)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.output,
        json!({"key": "Bearer secret", "count": 3, "seed": "abc"})
    );
}

#[tokio::test]
async fn test_missing_environment_variable_fails_run() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("env")
        .with_block(start())
        .with_block(
            Block::new("call", "response").with_config(json!({"data": "Bearer {{API_KEY}}"})),
        )
        .connect("start", "call");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_code.as_deref(), Some("REFERENCE_ERROR"));
    assert_eq!(result.metadata.failed_block_id.as_deref(), Some("call"));
    assert_eq!(
        result.metadata.unresolved_token.as_deref(),
        Some("{{API_KEY}}")
    );
}

#[tokio::test]
async fn test_block_failure_stops_run() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("failing")
        .with_block(start())
        .with_block(Block::new("boom", "fail").with_config(json!({"message": "upstream down"})))
        .with_block(Block::new("after", "count"))
        .connect("start", "boom")
        .connect("boom", "after");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_code.as_deref(), Some("BLOCK_EXECUTION_ERROR"));
    assert_eq!(result.metadata.failed_block_id.as_deref(), Some("boom"));
    assert!(result.error.as_ref().unwrap().contains("upstream down"));
    assert_eq!(tracker.runs("after"), 0);

    let failed: Vec<_> = result.logs_for("boom").collect();
    assert_eq!(failed.len(), 1);
    assert!(!failed[0].success);
}

#[tokio::test]
async fn test_error_edge_routes_failure() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("recovering")
        .with_block(start())
        .with_block(Block::new("boom", "fail").with_config(json!({"message": "upstream down"})))
        .with_block(Block::new("normal", "count"))
        .with_block(
            Block::new("recover", "response").with_config(json!({"data": "handled: <boom.error>"})),
        )
        .connect("start", "boom")
        .connect("boom", "normal")
        .connect_handle("boom", "error", "recover");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, json!("handled: upstream down"));
    assert_eq!(tracker.runs("normal"), 0);
    assert!(result.skipped_blocks.contains(&"normal".to_string()));
}

#[tokio::test]
async fn test_handler_panic_is_reported() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("panicking")
        .with_block(start())
        .with_block(Block::new("bad", "panic"))
        .connect("start", "bad");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.metadata.failed_block_id.as_deref(), Some("bad"));
    assert!(result.error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);

    let def = WorkflowDefinition::new("cancelled")
        .with_block(start())
        .with_block(Block::new("work", "count"))
        .connect("start", "work");

    let cancel = CancelHandle::new();
    cancel.cancel();
    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new().with_cancel(cancel))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.error_code.as_deref(), Some("CANCELLED"));
    assert!(result.executed_blocks.is_empty());
}

#[tokio::test]
async fn test_cancelled_mid_run() {
    let cancel = CancelHandle::new();
    let tracker = Tracker::new();
    let mut registry = HandlerRegistry::with_builtins();
    registry.register(Arc::new(TripHandler(cancel.clone())));
    registry.register(Arc::new(common::CountHandler(Arc::clone(&tracker))));
    let engine = Engine::new().with_registry(Arc::new(registry));

    let def = WorkflowDefinition::new("tripping")
        .with_block(start())
        .with_block(Block::new("trip", "trip"))
        .with_block(Block::new("after", "count"))
        .connect("start", "trip")
        .connect("trip", "after");

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new().with_cancel(cancel))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.metadata.failed_block_id.as_deref(), Some("after"));
    assert!(result.executed_blocks.contains(&"trip".to_string()));
    assert_eq!(tracker.runs("after"), 0);
}

#[tokio::test]
async fn test_global_concurrency_limit() {
    let tracker = Tracker::new();
    let mut engine = common::engine(&tracker);
    engine.set_max_concurrency(2);

    let mut def = WorkflowDefinition::new("fan_out").with_block(start());
    for i in 0..5 {
        let id = format!("s{}", i);
        def = def
            .with_block(Block::new(&id, "sleep").with_config(json!({"ms": 20, "value": i})))
            .connect("start", &id);
    }

    let result = engine
        .execute(engine.load(def).unwrap(), RunRequest::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.metadata.executed_block_count, 6);
    assert!(tracker.peak() <= 2, "peak was {}", tracker.peak());
}

#[tokio::test]
async fn test_rejects_invalid_execution_id() {
    let tracker = Tracker::new();
    let engine = common::engine(&tracker);
    let def = WorkflowDefinition::new("ids").with_block(start());

    let err = engine
        .execute(
            engine.load(def).unwrap(),
            RunRequest::new().with_execution_id("../escape"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CHECKPOINT_ERROR");
}

#[test]
fn test_load_rejects_broken_graph() {
    let engine = Engine::new();

    let def = WorkflowDefinition::new("broken")
        .with_block(start())
        .connect("start", "ghost");
    match engine.load(def) {
        Err(EngineError::Structural(StructuralError::UnknownEdgeEndpoint { endpoint, .. })) => {
            assert_eq!(endpoint, "ghost");
        }
        other => panic!("expected unknown endpoint, got {:?}", other.map(|w| w.id().to_string())),
    }

    let def = WorkflowDefinition::new("untyped")
        .with_block(start())
        .with_block(Block::new("x", "no_such_type"))
        .connect("start", "x");
    let err = engine.load(def).unwrap_err();
    assert_eq!(err.code(), "STRUCTURAL_ERROR");
}
