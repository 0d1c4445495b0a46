// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Load-test runner.
//!
//! A pool of virtual users runs the flow repeatedly. Active VU count ramps
//! linearly from 0 to N across `ramp_up`, holds, then ramps back down.
//! Latency samples from terminal HTTP-like steps feed a t-digest; a ticker
//! emits per-second timeline buckets while the run progresses.

use crate::digest::TDigest;
use dashmap::DashMap;
use flowmesh_core::model::{
    LoadMetrics, LoadTestResult, LoadTestStatus, StepState, TimelineBucket, TriggerSource,
};
use flowmesh_core::{FlowError, Result};
use flowmesh_engine::{FlowInterpreter, CANCEL_GRACE_MS};
use flowmesh_state::{FlowStore, LoadTestStore, StepStore};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Load-mode execution config.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub workspace_id: Uuid,
    pub flow_id: Uuid,
    pub virtual_users: u32,
    pub duration_ms: u64,
    pub ramp_up_ms: u64,
    pub ramp_down_ms: u64,
    pub think_time_ms: u64,
    pub environment: Option<String>,
    pub variables: Map<String, Value>,
    /// Timeline bucket width; 1 s per the wire contract.
    pub bucket_interval_ms: u64,
}

impl LoadConfig {
    pub fn new(workspace_id: Uuid, flow_id: Uuid, virtual_users: u32, duration_ms: u64) -> Self {
        Self {
            workspace_id,
            flow_id,
            virtual_users: virtual_users.max(1),
            duration_ms,
            ramp_up_ms: 0,
            ramp_down_ms: 0,
            think_time_ms: 0,
            environment: None,
            variables: Map::new(),
            bucket_interval_ms: 1_000,
        }
    }
}

/// Accumulators for the current timeline bucket.
#[derive(Default)]
struct BucketAccum {
    requests: u64,
    errors: u64,
    iterations: u64,
    digest: TDigest,
}

impl BucketAccum {
    fn take(&mut self) -> BucketAccum {
        std::mem::take(self)
    }
}

struct Stats {
    digest: Mutex<TDigest>,
    bucket: Mutex<BucketAccum>,
    active_vus: AtomicU32,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_iterations: AtomicU64,
}

struct RunHandle {
    token: CancellationToken,
    stopped: Arc<AtomicBool>,
}

/// Runs and tracks load tests.
#[derive(Clone)]
pub struct LoadRunner {
    interpreter: FlowInterpreter,
    flows: Arc<dyn FlowStore>,
    steps: Arc<dyn StepStore>,
    results: Arc<dyn LoadTestStore>,
    active: Arc<DashMap<Uuid, Arc<RunHandle>>>,
}

impl LoadRunner {
    pub fn new(
        interpreter: FlowInterpreter,
        flows: Arc<dyn FlowStore>,
        steps: Arc<dyn StepStore>,
        results: Arc<dyn LoadTestStore>,
    ) -> Self {
        Self {
            interpreter,
            flows,
            steps,
            results,
            active: Arc::new(DashMap::new()),
        }
    }

    /// `loadtest.start`: allocates the result id, stores it with
    /// `status=starting`, and launches the run in the background. The id
    /// returned is the id of the running test.
    pub async fn start(&self, config: LoadConfig) -> Result<Uuid> {
        let flow = self
            .flows
            .get(config.workspace_id, config.flow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("flow {}", config.flow_id)))?;

        let result = LoadTestResult::starting(config.flow_id);
        let result_id = result.id;
        self.results.insert(result.clone()).await?;

        let handle = Arc::new(RunHandle {
            token: CancellationToken::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        });
        self.active.insert(result_id, handle.clone());

        let runner = self.clone();
        let definition = flow.definition;
        tokio::spawn(async move {
            runner.orchestrate(config, definition, result, handle).await;
        });
        Ok(result_id)
    }

    /// `loadtest.stop`: cancels the run; VUs terminate within the grace
    /// period or are recorded as orphaned.
    pub async fn stop(&self, id: Uuid) -> Result<()> {
        if let Some(handle) = self.active.get(&id) {
            handle.stopped.store(true, Ordering::Release);
            handle.token.cancel();
            return Ok(());
        }
        match self.results.get(id).await? {
            Some(_) => Ok(()),
            None => Err(FlowError::NotFound(format!("load test {id}"))),
        }
    }

    /// `loadtest.get`.
    pub async fn get(&self, id: Uuid) -> Result<LoadTestResult> {
        self.results
            .get(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("load test {id}")))
    }

    /// `loadtest.metrics`.
    pub async fn metrics(&self, id: Uuid) -> Result<LoadMetrics> {
        Ok(self.get(id).await?.metrics)
    }

    /// `loadtest.timeline`.
    pub async fn timeline(&self, id: Uuid) -> Result<Vec<TimelineBucket>> {
        Ok(self.get(id).await?.timeline)
    }

    async fn orchestrate(
        &self,
        config: LoadConfig,
        definition: flowmesh_core::FlowDefinition,
        mut result: LoadTestResult,
        handle: Arc<RunHandle>,
    ) {
        info!(load_test_id = %result.id, vus = config.virtual_users, "load test starting");
        result.status = LoadTestStatus::Running;
        let _ = self.results.update(result.clone()).await;

        let http_like: HashSet<String> = definition
            .walk_steps()
            .into_iter()
            .filter(|s| s.action.is_http_like())
            .map(|s| s.id)
            .collect();

        let stats = Arc::new(Stats {
            digest: Mutex::new(TDigest::default()),
            bucket: Mutex::new(BucketAccum::default()),
            active_vus: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_iterations: AtomicU64::new(0),
        });
        let timeline = Arc::new(Mutex::new(Vec::<TimelineBucket>::new()));

        // Timeline ticker.
        let ticker_stats = stats.clone();
        let ticker_timeline = timeline.clone();
        let ticker_token = handle.token.clone();
        let ticker_results = self.results.clone();
        let ticker_result_id = result.id;
        let bucket_interval = Duration::from_millis(config.bucket_interval_ms.max(100));
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(bucket_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ticker_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let mut accum = ticker_stats.bucket.lock().take();
                let secs = bucket_interval.as_secs_f64();
                let bucket = TimelineBucket {
                    t: chrono::Utc::now(),
                    rps: accum.requests as f64 / secs,
                    active_vus: ticker_stats.active_vus.load(Ordering::Relaxed),
                    iterations: accum.iterations,
                    latency_p50_ms: accum.digest.quantile(0.50),
                    latency_p95_ms: accum.digest.quantile(0.95),
                    error_rate: if accum.requests > 0 {
                        accum.errors as f64 / accum.requests as f64
                    } else {
                        0.0
                    },
                };
                {
                    let mut guard = ticker_timeline.lock();
                    guard.push(bucket);
                }
                // Live progress: persist the partial timeline.
                if let Ok(Some(mut current)) = ticker_results.get(ticker_result_id).await {
                    current.timeline = ticker_timeline.lock().clone();
                    let _ = ticker_results.update(current).await;
                }
            }
        });

        // Virtual users.
        let vu_count = config.virtual_users as u64;
        let mut vus = JoinSet::new();
        for i in 0..config.virtual_users {
            let start_delay =
                Duration::from_millis(config.ramp_up_ms * i as u64 / vu_count.max(1));
            let stop_offset_ms = config
                .duration_ms
                .saturating_sub(config.ramp_down_ms * i as u64 / vu_count.max(1));
            let vu = VirtualUser {
                interpreter: self.interpreter.clone(),
                steps: self.steps.clone(),
                stats: stats.clone(),
                token: handle.token.clone(),
                definition: definition.clone(),
                config: config.clone(),
                http_like: http_like.clone(),
                result_id: result.id,
            };
            vus.spawn(async move {
                vu.run(start_delay, Duration::from_millis(stop_offset_ms)).await;
            });
        }

        // Hold until duration elapses or the run is stopped.
        tokio::select! {
            _ = handle.token.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(config.duration_ms)) => {}
        }
        handle.token.cancel();

        // VUs get a bounded grace period; stragglers are orphaned.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(CANCEL_GRACE_MS);
        let mut orphaned: u32 = 0;
        loop {
            match tokio::time::timeout_at(deadline, vus.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    orphaned = vus.len() as u32;
                    vus.abort_all();
                    warn!(load_test_id = %result.id, orphaned = orphaned, "virtual users orphaned");
                    break;
                }
            }
        }
        ticker.abort();

        // Final aggregate.
        let total_requests = stats.total_requests.load(Ordering::Relaxed);
        let total_errors = stats.total_errors.load(Ordering::Relaxed);
        let duration_secs = (config.duration_ms as f64 / 1_000.0).max(f64::EPSILON);
        result.metrics = {
            let mut digest = stats.digest.lock();
            LoadMetrics {
                total_requests,
                success_count: total_requests.saturating_sub(total_errors),
                error_count: total_errors,
                throughput_rps: total_requests as f64 / duration_secs,
                latency_min_ms: digest.min(),
                latency_avg_ms: digest.mean(),
                latency_max_ms: digest.max(),
                latency_p50_ms: digest.quantile(0.50),
                latency_p90_ms: digest.quantile(0.90),
                latency_p95_ms: digest.quantile(0.95),
                latency_p99_ms: digest.quantile(0.99),
            }
        };
        result.timeline = timeline.lock().clone();
        result.orphaned_vus = orphaned;
        result.finished_at = Some(chrono::Utc::now());
        result.status = if handle.stopped.load(Ordering::Acquire) {
            LoadTestStatus::Cancelled
        } else {
            LoadTestStatus::Finished
        };
        let _ = self.results.update(result.clone()).await;
        self.active.remove(&result.id);
        info!(
            load_test_id = %result.id,
            status = ?result.status,
            requests = total_requests,
            "load test finished"
        );
    }
}

struct VirtualUser {
    interpreter: FlowInterpreter,
    steps: Arc<dyn StepStore>,
    stats: Arc<Stats>,
    token: CancellationToken,
    definition: flowmesh_core::FlowDefinition,
    config: LoadConfig,
    http_like: HashSet<String>,
    result_id: Uuid,
}

impl VirtualUser {
    async fn run(self, start_delay: Duration, stop_offset: Duration) {
        let started = tokio::time::Instant::now();
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = tokio::time::sleep(start_delay) => {}
        }
        self.stats.active_vus.fetch_add(1, Ordering::Relaxed);

        loop {
            if self.token.is_cancelled() || started.elapsed() >= stop_offset {
                break;
            }
            self.iterate().await;
            if self.config.think_time_ms > 0 {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(self.config.think_time_ms)) => {}
                }
            }
        }
        self.stats.active_vus.fetch_sub(1, Ordering::Relaxed);
    }

    async fn iterate(&self) {
        let execution = flowmesh_core::model::Execution::new(
            self.config.flow_id,
            self.config.workspace_id,
            self.definition.clone(),
            TriggerSource::Collection(self.result_id),
        )
        .with_environment(self.config.environment.clone())
        .with_variables(self.config.variables.clone());
        let execution_id = execution.id;

        let outcome = self.interpreter.run(execution, Map::new()).await;
        self.stats.total_iterations.fetch_add(1, Ordering::Relaxed);
        {
            let mut bucket = self.stats.bucket.lock();
            bucket.iterations += 1;
        }
        if outcome.is_err() {
            return;
        }

        // Latency samples come from terminal HTTP-like steps.
        let records = match self.steps.list_for_execution(execution_id).await {
            Ok(records) => records,
            Err(_) => return,
        };
        for record in records {
            if !self.http_like.contains(&record.step_id) {
                continue;
            }
            let latency = record.duration_ms as f64;
            let failed = record.status == StepState::Failed;
            self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.digest.lock().add(latency);
            let mut bucket = self.stats.bucket.lock();
            bucket.requests += 1;
            if failed {
                bucket.errors += 1;
            }
            bucket.digest.add(latency);
        }
    }
}
