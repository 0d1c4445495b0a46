// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Collection and load runner scenarios with injected-latency handlers.

use async_trait::async_trait;
use flowmesh_core::model::{FlowRecord, LoadTestStatus};
use flowmesh_core::{ActionKind, FlowDefinition, Result, Scope};
use flowmesh_engine::{
    ActionHandler, ActionOutput, ActionRegistry, DebuggerController, EventHub, FlowInterpreter,
    StepContext,
};
use flowmesh_runner::{
    CollectionConfig, CollectionRunner, DataSource, LoadConfig, LoadRunner,
};
use flowmesh_state::{
    FlowStore, InMemoryExecutionStore, InMemoryFlowStore, InMemoryLoadTestStore,
    InMemoryStepStore,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// HTTP-like handler that sleeps a uniform random latency per call.
struct LatencyHandler {
    min_ms: u64,
    max_ms: u64,
    seen: Mutex<Vec<Value>>,
}

impl LatencyHandler {
    fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms, seen: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ActionHandler for LatencyHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::HttpRequest
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        self.seen.lock().push(config);
        let latency = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        tokio::time::sleep(Duration::from_millis(latency)).await;
        Ok(ActionOutput::value(json!({"status": 200, "body": {"ok": true}})))
    }
}

struct Stack {
    interpreter: FlowInterpreter,
    flows: Arc<InMemoryFlowStore>,
    steps: Arc<InMemoryStepStore>,
}

fn stack(handler: Arc<dyn ActionHandler>) -> Stack {
    let registry = ActionRegistry::new();
    registry.register(handler);
    let hub = EventHub::new();
    let flows = Arc::new(InMemoryFlowStore::new());
    let steps = Arc::new(InMemoryStepStore::new());
    let interpreter = FlowInterpreter::new(
        Arc::new(registry),
        hub.clone(),
        Arc::new(DebuggerController::new(hub)),
        Arc::new(InMemoryExecutionStore::new()),
        steps.clone(),
        flows.clone(),
    );
    Stack { interpreter, flows, steps }
}

fn single_http_flow() -> FlowDefinition {
    FlowDefinition::from_value(json!({
        "name": "one-request",
        "steps": [{
            "id": "req",
            "action": "http_request",
            "config": {"method": "GET", "url": "https://load.test/endpoint"},
        }],
    }))
    .unwrap()
}

#[tokio::test]
async fn load_test_produces_monotone_timeline_and_ordered_percentiles() {
    let handler = Arc::new(LatencyHandler::new(10, 20));
    let s = stack(handler);
    let workspace_id = Uuid::new_v4();
    let flow = FlowRecord::new(workspace_id, single_http_flow());
    let flow_id = flow.id;
    s.flows.put(flow).await.unwrap();

    let results = Arc::new(InMemoryLoadTestStore::new());
    let runner = LoadRunner::new(s.interpreter, s.flows, s.steps, results);

    let mut config = LoadConfig::new(workspace_id, flow_id, 5, 1_500);
    config.bucket_interval_ms = 300;
    let id = runner.start(config).await.unwrap();

    // The result record exists immediately, before the run finishes.
    let starting = runner.get(id).await.unwrap();
    assert!(matches!(
        starting.status,
        LoadTestStatus::Starting | LoadTestStatus::Running
    ));

    // Wait for the run to settle.
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let current = runner.get(id).await.unwrap();
            if current.status.is_terminal() {
                break current;
            }
        }
    })
    .await
    .expect("load test did not finish");

    assert_eq!(result.status, LoadTestStatus::Finished);
    assert!(result.metrics.total_requests > 10, "requests: {}", result.metrics.total_requests);
    assert_eq!(result.metrics.error_count, 0);

    // Latencies come from the injected 10..=20 ms distribution.
    assert!(result.metrics.latency_min_ms >= 9.0);
    assert!(result.metrics.latency_max_ms <= 40.0, "max {}", result.metrics.latency_max_ms);
    assert!(
        result.metrics.latency_p50_ms <= result.metrics.latency_p95_ms
            && result.metrics.latency_p95_ms <= result.metrics.latency_p99_ms
    );

    // Timeline bucket timestamps are monotone non-decreasing.
    assert!(!result.timeline.is_empty());
    for window in result.timeline.windows(2) {
        assert!(window[1].t >= window[0].t);
    }
    assert_eq!(result.orphaned_vus, 0);
}

#[tokio::test]
async fn load_test_stop_cancels_the_run() {
    let handler = Arc::new(LatencyHandler::new(5, 10));
    let s = stack(handler);
    let workspace_id = Uuid::new_v4();
    let flow = FlowRecord::new(workspace_id, single_http_flow());
    let flow_id = flow.id;
    s.flows.put(flow).await.unwrap();

    let results = Arc::new(InMemoryLoadTestStore::new());
    let runner = LoadRunner::new(s.interpreter, s.flows, s.steps, results);

    let config = LoadConfig::new(workspace_id, flow_id, 3, 60_000);
    let id = runner.start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.stop(id).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = runner.get(id).await.unwrap();
            if current.status.is_terminal() {
                break current;
            }
        }
    })
    .await
    .expect("stop did not settle");
    assert_eq!(result.status, LoadTestStatus::Cancelled);
}

#[tokio::test]
async fn collection_maps_columns_onto_variables() {
    let handler = Arc::new(LatencyHandler::new(1, 2));
    let s = stack(handler.clone());
    let workspace_id = Uuid::new_v4();
    let flow = FlowRecord::new(
        workspace_id,
        FlowDefinition::from_value(json!({
            "name": "per-user",
            "steps": [{
                "id": "req",
                "action": "http_request",
                "config": {
                    "method": "GET",
                    "url": "https://load.test/users/{{ vars.user_id }}",
                },
            }],
        }))
        .unwrap(),
    );
    let flow_id = flow.id;
    s.flows.put(flow).await.unwrap();

    let runner = CollectionRunner::new(s.interpreter, s.flows);
    let config = CollectionConfig {
        workspace_id,
        flow_ids: vec![flow_id],
        data: DataSource::Csv("uid,name\n101,ana\n102,ben\n103,cy\n".to_string()),
        variable_mapping: [("uid".to_string(), "user_id".to_string())].into(),
        parallel: 2,
        stop_on_error: false,
        environment: None,
    };

    let outcome = runner.run(config).await.unwrap();
    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.passed, 3);
    assert_eq!(outcome.failed, 0);

    let mut urls: Vec<String> = handler
        .seen
        .lock()
        .iter()
        .map(|c| c["url"].as_str().unwrap().to_string())
        .collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://load.test/users/101",
            "https://load.test/users/102",
            "https://load.test/users/103",
        ]
    );
}

#[tokio::test]
async fn jsonl_and_count_data_sources() {
    let jsonl = DataSource::JsonLines("{\"a\":1}\n\n{\"a\":2}\n".to_string());
    assert_eq!(jsonl.rows().unwrap().len(), 2);

    let count = DataSource::Count(4);
    assert_eq!(count.rows().unwrap().len(), 4);

    let bad = DataSource::JsonLines("[1,2]\n".to_string());
    assert!(bad.rows().is_err());
}
