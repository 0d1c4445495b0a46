// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! End-to-end interpreter scenarios with scripted handlers.

use async_trait::async_trait;
use flowmesh_core::model::{
    Breakpoint, EventType, Execution, ExecutionStatus, RunEvent, StepState, TriggerSource,
};
use flowmesh_core::{ActionKind, FlowDefinition, FlowError, Result, Scope};
use flowmesh_engine::{
    ActionHandler, ActionOutput, ActionRegistry, DebuggerController, EventHub, FlowInterpreter,
    StepContext,
};
use flowmesh_state::{
    InMemoryExecutionStore, InMemoryFlowStore, InMemoryStepStore, StepStore,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Scripted HTTP-like handler: responds per URL, records resolved configs.
#[derive(Default)]
struct ScriptedHttp {
    responses: Mutex<std::collections::HashMap<String, Value>>,
    seen: Mutex<Vec<Value>>,
    /// Attempts that should fail with a timeout before succeeding.
    fail_first_attempts: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedHttp {
    fn respond(&self, url: &str, body: Value) {
        self.responses.lock().insert(url.to_string(), body);
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ActionHandler for ScriptedHttp {
    fn kind(&self) -> ActionKind {
        ActionKind::HttpRequest
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        self.seen.lock().push(config.clone());

        if self
            .fail_first_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlowError::Timeout { elapsed_ms: 10, budget_ms: 10 });
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = ctx.execution.cancellation().cancelled() => {
                    return Err(FlowError::Cancelled(
                        ctx.execution.cancel_reason()
                            .unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                    ));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let url = config["url"].as_str().unwrap_or_default().to_string();
        let body = self
            .responses
            .lock()
            .get(&url)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(ActionOutput::value(json!({
            "status": 200,
            "headers": {"content-type": "application/json"},
            "body": body,
            "body_raw": body.to_string(),
        })))
    }
}

/// Handler that always fails after a fixed delay.
struct FailingHandler {
    delay: Duration,
}

#[async_trait]
impl ActionHandler for FailingHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Shell
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        _config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        tokio::time::sleep(self.delay).await;
        Err(FlowError::handler("boom"))
    }
}

struct Harness {
    interpreter: FlowInterpreter,
    debugger: Arc<DebuggerController>,
    steps: Arc<InMemoryStepStore>,
    hub: EventHub,
}

fn harness(registry: ActionRegistry) -> Harness {
    let hub = EventHub::new();
    let debugger = Arc::new(DebuggerController::new(hub.clone()));
    let steps = Arc::new(InMemoryStepStore::new());
    let interpreter = FlowInterpreter::new(
        Arc::new(registry),
        hub.clone(),
        debugger.clone(),
        Arc::new(InMemoryExecutionStore::new()),
        steps.clone(),
        Arc::new(InMemoryFlowStore::new()),
    );
    Harness { interpreter, debugger, steps, hub }
}

fn execution_for(definition: Value) -> Execution {
    let definition = FlowDefinition::from_value(definition).unwrap();
    Execution::new(Uuid::new_v4(), Uuid::new_v4(), definition, TriggerSource::Api)
}

async fn drain(subscription: &mut flowmesh_engine::Subscription) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn http_happy_path() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://example.test/ping", json!({"ok": true}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "ping",
        "steps": [{
            "id": "ping",
            "action": "http_request",
            "config": {"method": "GET", "url": "https://example.test/ping"},
            "assertions": [{"kind": "status_code", "expected": 200}],
        }],
    }));
    let mut subscription = h.hub.subscribe(execution.id);

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.passed_steps, 1);
    assert_eq!(finished.total_steps, 1);

    let records = h.steps.list_for_execution(finished.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, StepState::Passed);
    assert!(records[0].assertion_results[0].ok);

    let events = drain(&mut subscription).await;
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ExecutionStarted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::ExecutionCompleted,
        ]
    );
}

#[tokio::test]
async fn variable_capture_across_steps() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/login", json!({"token": "abc"}));
    http.respond("https://api.test/me", json!({"id": 7}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "login-then-me",
        "steps": [
            {
                "id": "step1",
                "action": "http_request",
                "config": {"method": "POST", "url": "https://api.test/login"},
                "save": {"token": "$.token"},
            },
            {
                "id": "step2",
                "action": "http_request",
                "config": {
                    "method": "GET",
                    "url": "https://api.test/me",
                    "headers": {"Authorization": "Bearer {{ steps.step1.token }}"},
                },
            },
        ],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.total_steps, 2);
    assert_eq!(finished.passed_steps, 2);

    // The outbound header must carry the captured token verbatim.
    let seen = http.seen();
    assert_eq!(seen[1]["headers"]["Authorization"], json!("Bearer abc"));
}

#[tokio::test]
async fn retry_then_success_persists_every_attempt() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/flaky", json!({"ok": true}));
    http.fail_first_attempts.store(1, Ordering::SeqCst);
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "flaky",
        "steps": [{
            "id": "flaky",
            "action": "http_request",
            "config": {"method": "GET", "url": "https://api.test/flaky"},
            "retry": {"max_attempts": 2, "backoff_ms": 10},
        }],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);

    let records = h.steps.list_for_execution(finished.id).await.unwrap();
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt_number).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(records[0].status, StepState::Failed);
    assert_eq!(records[1].status, StepState::Passed);
}

#[tokio::test]
async fn parallel_fail_fast_cancels_siblings() {
    let http = Arc::new(ScriptedHttp::default());
    *http.delay.lock() = Some(Duration::from_millis(300));
    http.respond("https://api.test/slow", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    registry.register(Arc::new(FailingHandler { delay: Duration::from_millis(50) }));
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "parallel",
        "steps": [{
            "id": "par",
            "action": "parallel",
            "config": {
                "fail_fast": true,
                "steps": [
                    {"id": "a", "action": "http_request",
                     "config": {"method": "GET", "url": "https://api.test/slow"}},
                    {"id": "b", "action": "shell", "config": {"command": "x"}},
                    {"id": "c", "action": "http_request",
                     "config": {"method": "GET", "url": "https://api.test/slow"}},
                ],
            },
        }],
    }));
    let mut subscription = h.hub.subscribe(execution.id);

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);

    let records = h.steps.list_for_execution(finished.id).await.unwrap();
    let find = |id: &str| records.iter().find(|r| r.step_id == id);
    assert_eq!(find("b").unwrap().status, StepState::Failed);
    for sibling in ["a", "c"] {
        if let Some(record) = find(sibling) {
            assert_eq!(record.status, StepState::Cancelled, "sibling {sibling}");
        }
    }

    // The failing child's event lands before the cancelled siblings'.
    let events = drain(&mut subscription).await;
    let failed_pos = events
        .iter()
        .position(|e| {
            e.event_type == EventType::StepFailed && e.payload["step_id"] == "b"
        })
        .expect("child b failure event");
    for (i, event) in events.iter().enumerate() {
        if event.payload["step_id"] == "a" && event.event_type == EventType::StepFailed {
            assert!(i > failed_pos);
        }
    }
}

#[tokio::test]
async fn breakpoint_pause_step_resume() {
    let registry = ActionRegistry::new();
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "debuggable",
        "steps": [
            {"id": "s1", "action": "wait", "config": {"duration": 1}},
            {"id": "s2", "action": "wait", "config": {"duration": 1}},
            {"id": "s3", "action": "wait", "config": {"duration": 1}},
        ],
    }));
    let execution_id = execution.id;
    let flow_id = execution.flow_id;

    let session = h.debugger.start(execution_id, flow_id).unwrap();
    h.debugger
        .add_breakpoint(session.id, Breakpoint::on_step("s2"))
        .unwrap();

    let mut subscription = h.hub.subscribe_debugger(execution_id);
    let interpreter = h.interpreter.clone();
    let run = tokio::spawn(async move { interpreter.run(execution, Map::new()).await });

    // Paused before s2 dispatch.
    let paused = wait_for(&mut subscription, EventType::DebugPaused).await;
    assert_eq!(paused.payload["step_id"], "s2");
    {
        let session_state = h.debugger.session(session.id).unwrap();
        assert_eq!(session_state.state, flowmesh_core::model::DebugState::Paused);
        assert_eq!(session_state.current_step.as_deref(), Some("s2"));
    }

    // Step over runs exactly s2 and re-pauses before s3.
    h.debugger.step_over(session.id).unwrap();
    let paused_again = wait_for(&mut subscription, EventType::DebugPaused).await;
    assert_eq!(paused_again.payload["step_id"], "s3");

    // Resume runs to completion; the session stops on terminal.
    h.debugger.resume(session.id).unwrap();
    let finished = run.await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.passed_steps, 3);
    let session_state = h.debugger.session(session.id).unwrap();
    assert_eq!(session_state.state, flowmesh_core::model::DebugState::Stopped);
    assert!(session_state.step_history.len() >= 2);
}

async fn wait_for(
    subscription: &mut flowmesh_engine::Subscription,
    event_type: EventType,
) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = subscription.recv().await.expect("hub closed");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn guard_skips_and_counters_add_up() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/x", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http);
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "guards",
        "variables": {"enabled": false},
        "steps": [
            {"id": "always", "action": "http_request",
             "config": {"method": "GET", "url": "https://api.test/x"}},
            {"id": "never", "action": "http_request", "when": "vars.enabled",
             "config": {"method": "GET", "url": "https://api.test/x"}},
        ],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.passed_steps, 1);
    assert_eq!(finished.skipped_steps, 1);
    assert_eq!(
        finished.passed_steps + finished.failed_steps + finished.skipped_steps,
        finished.total_steps
    );
}

#[tokio::test]
async fn for_each_binds_iteration_scope() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/items", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "loops",
        "steps": [{
            "id": "each",
            "action": "for_each",
            "config": {
                "items": [10, 20, 30],
                "steps": [{
                    "id": "child",
                    "action": "http_request",
                    "config": {
                        "method": "GET",
                        "url": "https://api.test/items",
                        "query": {"i": "{{ iteration.index }}", "v": "{{ iteration.value }}"},
                    },
                }],
            },
        }],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);

    let seen = http.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0]["query"]["i"], json!(0));
    assert_eq!(seen[2]["query"]["v"], json!(30));
}

#[tokio::test]
async fn teardown_runs_after_body_failure() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/cleanup", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    registry.register(Arc::new(FailingHandler { delay: Duration::ZERO }));
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "teardown",
        "steps": [{"id": "fails", "action": "shell", "config": {"command": "x"}}],
        "teardown": [{"id": "cleanup", "action": "http_request",
                      "config": {"method": "GET", "url": "https://api.test/cleanup"}}],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    // The teardown request still went out.
    assert_eq!(http.seen().len(), 1);

    let records = h.steps.list_for_execution(finished.id).await.unwrap();
    assert!(records.iter().any(|r| r.step_id == "cleanup" && r.status == StepState::Passed));
}

#[tokio::test]
async fn cancel_mid_run_is_idempotent() {
    let http = Arc::new(ScriptedHttp::default());
    *http.delay.lock() = Some(Duration::from_secs(10));
    http.respond("https://api.test/slow", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http);
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "cancellable",
        "steps": [{"id": "slow", "action": "http_request",
                   "config": {"method": "GET", "url": "https://api.test/slow"}}],
    }));
    let execution_id = execution.id;

    let interpreter = h.interpreter.clone();
    let run = tokio::spawn(async move { interpreter.run(execution, Map::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.interpreter
        .cancel(execution_id, flowmesh_core::CancelReason::UserCancelled);
    // Second cancel is a no-op.
    h.interpreter
        .cancel(execution_id, flowmesh_core::CancelReason::Shutdown);

    let finished = run.await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
    assert_eq!(
        finished.error.as_ref().unwrap().kind,
        flowmesh_core::ErrorKind::Cancelled
    );

    let records = h.steps.list_for_execution(execution_id).await.unwrap();
    assert!(records.iter().all(|r| r.status == StepState::Cancelled));
}

#[tokio::test]
async fn assertion_failure_maps_to_assertion_failed() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/x", json!({"ok": false}));
    let registry = ActionRegistry::new();
    registry.register(http);
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "asserts",
        "steps": [{
            "id": "check",
            "action": "http_request",
            "config": {"method": "GET", "url": "https://api.test/x"},
            "assertions": [
                {"kind": "json_path", "target": "$.ok", "expected": true},
            ],
        }],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(
        finished.error.as_ref().unwrap().kind,
        flowmesh_core::ErrorKind::AssertionFailed
    );
}

#[tokio::test]
async fn sub_flow_exports_outputs_and_caps_recursion() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/token", json!({"token": "xyz"}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());

    let hub = EventHub::new();
    let debugger = Arc::new(DebuggerController::new(hub.clone()));
    let steps = Arc::new(InMemoryStepStore::new());
    let flows = Arc::new(InMemoryFlowStore::new());
    let interpreter = FlowInterpreter::new(
        Arc::new(registry),
        hub,
        debugger,
        Arc::new(InMemoryExecutionStore::new()),
        steps.clone(),
        flows.clone(),
    );

    let workspace_id = Uuid::new_v4();
    let child = flowmesh_core::model::FlowRecord::new(
        workspace_id,
        FlowDefinition::from_value(json!({
            "name": "fetch-token",
            "variables": {"audience": "default"},
            "steps": [{
                "id": "fetch",
                "action": "http_request",
                "config": {
                    "method": "GET",
                    "url": "https://api.test/token",
                    "query": {"aud": "{{ vars.audience }}"},
                },
                "save": {"token": "$.token"},
            }],
        }))
        .unwrap(),
    );
    let child_id = child.id;
    flowmesh_state::FlowStore::put(flows.as_ref(), child)
        .await
        .unwrap();

    let parent = FlowDefinition::from_value(json!({
        "name": "parent",
        "steps": [
            {
                "id": "auth",
                "action": "sub_flow",
                "config": {"flow_id": child_id, "inputs": {"audience": "billing"}},
                "save": {"token": "$.steps.fetch.token"},
            },
            {
                "id": "use_token",
                "action": "http_request",
                "config": {
                    "method": "GET",
                    "url": "https://api.test/token",
                    "headers": {"Authorization": "Bearer {{ steps.auth.token }}"},
                },
            },
        ],
    }))
    .unwrap();
    let execution =
        Execution::new(Uuid::new_v4(), workspace_id, parent, TriggerSource::Api);

    let finished = interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);

    let seen = http.seen();
    // The sub-flow saw the call-site input, and the parent saw the export.
    assert_eq!(seen[0]["query"]["aud"], json!("billing"));
    assert_eq!(seen[1]["headers"]["Authorization"], json!("Bearer xyz"));
}

#[tokio::test]
async fn sub_flow_recursion_limit_is_a_cycle_error() {
    let registry = ActionRegistry::new();
    let hub = EventHub::new();
    let debugger = Arc::new(DebuggerController::new(hub.clone()));
    let steps = Arc::new(InMemoryStepStore::new());
    let flows = Arc::new(InMemoryFlowStore::new());
    let interpreter = FlowInterpreter::new(
        Arc::new(registry),
        hub,
        debugger,
        Arc::new(InMemoryExecutionStore::new()),
        steps,
        flows.clone(),
    );

    // A flow whose only step calls itself.
    let workspace_id = Uuid::new_v4();
    let flow_id = Uuid::new_v4();
    let definition = FlowDefinition::from_value(json!({
        "name": "ouroboros",
        "steps": [{
            "id": "recurse",
            "action": "sub_flow",
            "config": {"flow_id": flow_id},
        }],
    }))
    .unwrap();
    let mut record = flowmesh_core::model::FlowRecord::new(workspace_id, definition.clone());
    record.id = flow_id;
    flowmesh_state::FlowStore::put(flows.as_ref(), record)
        .await
        .unwrap();

    let execution = Execution::new(flow_id, workspace_id, definition, TriggerSource::Api);
    let finished = interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(
        finished.error.as_ref().unwrap().kind,
        flowmesh_core::ErrorKind::Cycle
    );
}

#[tokio::test]
async fn condition_takes_the_else_branch() {
    let http = Arc::new(ScriptedHttp::default());
    http.respond("https://api.test/else", json!({}));
    let registry = ActionRegistry::new();
    registry.register(http.clone());
    let h = harness(registry);

    let execution = execution_for(json!({
        "name": "branching",
        "variables": {"mode": "fallback"},
        "steps": [{
            "id": "cond",
            "action": "condition",
            "config": {
                "if": "vars.mode == 'primary'",
                "then": [{"id": "then_step", "action": "http_request",
                          "config": {"method": "GET", "url": "https://api.test/then"}}],
                "else": [{"id": "else_step", "action": "http_request",
                          "config": {"method": "GET", "url": "https://api.test/else"}}],
            },
        }],
    }));

    let finished = h.interpreter.run(execution, Map::new()).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    let seen = http.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["url"], json!("https://api.test/else"));
}
