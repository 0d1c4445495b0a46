// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Flow interpreter.
//!
//! Walks a flow definition step by step: resolves inputs, consults the
//! debugger, dispatches to action handlers, enforces retry and timeout
//! budgets, evaluates assertions, binds `save` outputs into scope, and
//! publishes lifecycle events. Sequential steps execute in order on the
//! interpreter task; `parallel` children run as subtasks sharing the
//! execution's cancellation token with a private scope frame each.

use crate::context::ExecutionContext;
use crate::debug::DebuggerController;
use crate::hub::EventHub;
use crate::registry::{ActionOutput, ActionRegistry, StepContext};
use flowmesh_core::assertion::{evaluate_assertions, AssertionContext};
use flowmesh_core::model::{
    EventType, Execution, ExecutionStatus, RunEvent, StepExecution, StepState,
};
use flowmesh_core::value::extract_path;
use flowmesh_core::{
    expr, ActionKind, CancelReason, ConditionConfig, ErrorDetail, FlowError, ForEachConfig,
    Functions, ParallelConfig, Result, RetryPolicy, Scope, Step, SubFlowConfig, WaitConfig,
};
use flowmesh_state::{ExecutionStore, FlowStore, StepStore};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default step timeout when neither the step nor the flow sets one.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Default sub-flow recursion cap.
pub const DEFAULT_SUBFLOW_DEPTH: usize = 8;

/// Interpreter tunables.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub default_timeout_ms: u64,
    pub max_subflow_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            max_subflow_depth: DEFAULT_SUBFLOW_DEPTH,
        }
    }
}

/// Immutable per-run info threaded through step execution.
#[derive(Debug, Clone)]
struct RunInfo {
    execution_id: Uuid,
    workspace_id: Uuid,
    flow_timeout: Option<u64>,
    flow_retry: Option<RetryPolicy>,
}

/// Outcome of one step at the caller's granularity.
#[derive(Debug)]
struct StepOutcome {
    state: StepState,
    error: Option<ErrorDetail>,
    /// Bindings for `scope.steps.<id>`, re-bound by parallel parents.
    bindings: Option<(String, Value)>,
}

impl StepOutcome {
    fn skipped() -> Self {
        Self { state: StepState::Skipped, error: None, bindings: None }
    }

    fn cancelled(reason: CancelReason) -> Self {
        let err = FlowError::Cancelled(reason);
        Self { state: StepState::Cancelled, error: Some(ErrorDetail::from(&err)), bindings: None }
    }

    fn failed(err: &FlowError) -> Self {
        Self { state: StepState::Failed, error: Some(ErrorDetail::from(err)), bindings: None }
    }
}

/// The per-flow interpreter.
#[derive(Clone)]
pub struct FlowInterpreter {
    registry: Arc<ActionRegistry>,
    hub: EventHub,
    debugger: Arc<DebuggerController>,
    executions: Arc<dyn ExecutionStore>,
    steps: Arc<dyn StepStore>,
    flows: Arc<dyn FlowStore>,
    funcs: Arc<Functions>,
    config: InterpreterConfig,
    active: Arc<dashmap::DashMap<Uuid, ExecutionContext>>,
}

impl FlowInterpreter {
    pub fn new(
        registry: Arc<ActionRegistry>,
        hub: EventHub,
        debugger: Arc<DebuggerController>,
        executions: Arc<dyn ExecutionStore>,
        steps: Arc<dyn StepStore>,
        flows: Arc<dyn FlowStore>,
    ) -> Self {
        Self {
            registry,
            hub,
            debugger,
            executions,
            steps,
            flows,
            funcs: Arc::new(Functions::standard()),
            config: InterpreterConfig::default(),
            active: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Overrides interpreter tunables.
    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    /// The hub this interpreter publishes to.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Cancels a running execution. Idempotent; unknown ids are a no-op
    /// (the execution may already be terminal).
    pub fn cancel(&self, execution_id: Uuid, reason: CancelReason) {
        if let Some(ctx) = self.active.get(&execution_id) {
            ctx.cancel(reason);
        }
    }

    /// Runs an execution to its terminal state.
    ///
    /// `env` carries the named environment's variables; the initial scope
    /// merges (lowest to highest) environment defaults, flow `variables`,
    /// and the execution's runtime overrides.
    pub async fn run(
        &self,
        mut execution: Execution,
        env: Map<String, Value>,
    ) -> Result<Execution> {
        let definition = execution.definition.clone();

        if let Err(issues) = definition.validate() {
            let err = FlowError::InvalidDefinition(issues.join("; "));
            error!(execution_id = %execution.id, error = %err, "definition rejected");
            execution.mark_running();
            execution.finish(ExecutionStatus::Failed, Some(ErrorDetail::from(&err)));
            self.executions.insert(execution.clone()).await?;
            self.publish_terminal(&execution);
            return Ok(execution);
        }

        // Merged variable scope: runtime > environment > flow defaults.
        let mut vars = definition.variables.clone();
        for (k, v) in &execution.variables {
            vars.insert(k.clone(), v.clone());
        }
        let mut scope = Scope::new();
        scope.set_root("env", Value::Object(env));
        scope.set_root("vars", Value::Object(vars));
        scope.set_root("steps", Value::Object(Map::new()));

        let ctx = ExecutionContext::new(execution.id);
        self.active.insert(execution.id, ctx.clone());
        self.debugger.register_execution(ctx.clone());

        execution.mark_running();
        self.executions.insert(execution.clone()).await?;
        self.hub.publish(RunEvent::new(
            EventType::ExecutionStarted,
            execution.id,
            json!({"flow_id": execution.flow_id}),
        ));
        info!(execution_id = %execution.id, flow = %definition.name, "execution started");

        let info = RunInfo {
            execution_id: execution.id,
            workspace_id: execution.workspace_id,
            flow_timeout: definition.timeout,
            flow_retry: definition.retry.clone(),
        };

        // Setup runs with body semantics but outside pass/fail accounting;
        // a failure here fails the execution without running the body.
        let mut setup_error: Option<ErrorDetail> = None;
        for step in &definition.setup {
            let outcome = self.run_step(&info, &ctx, &mut scope, step, 0, false).await;
            match outcome.state {
                StepState::Failed => {
                    setup_error = outcome.error;
                    break;
                }
                StepState::Cancelled => break,
                _ => {}
            }
        }

        let mut first_error: Option<ErrorDetail> = setup_error.clone();
        if setup_error.is_none() && !ctx.is_cancelled() {
            for step in &definition.steps {
                let outcome = self.run_step(&info, &ctx, &mut scope, step, 0, true).await;
                match outcome.state {
                    StepState::Passed => ctx.record_passed(),
                    StepState::Skipped => ctx.record_skipped(),
                    StepState::Failed => {
                        ctx.record_failed();
                        if first_error.is_none() {
                            first_error = outcome.error.clone();
                        }
                        if !step.continue_on_error {
                            break;
                        }
                    }
                    StepState::Cancelled => break,
                    StepState::Pending | StepState::Running => {}
                }
            }
        }

        // Teardown runs unconditionally unless cancelled, and can never
        // fail the execution.
        if !ctx.is_cancelled() {
            for step in &definition.teardown {
                let outcome = self.run_step(&info, &ctx, &mut scope, step, 0, false).await;
                if outcome.state == StepState::Failed {
                    warn!(
                        execution_id = %execution.id,
                        step_id = %step.id,
                        "teardown step failed"
                    );
                }
                if outcome.state == StepState::Cancelled {
                    break;
                }
            }
        }

        let (passed, failed, skipped) = ctx.counters();
        execution.passed_steps = passed;
        execution.failed_steps = failed;
        execution.skipped_steps = skipped;
        execution.total_steps = passed + failed + skipped;

        let status = if ctx.is_cancelled() {
            ExecutionStatus::Cancelled
        } else if setup_error.is_some() || failed > 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        let terminal_error = if status == ExecutionStatus::Cancelled {
            let reason = ctx.cancel_reason().unwrap_or(CancelReason::UserCancelled);
            Some(ErrorDetail::from(&FlowError::Cancelled(reason)))
        } else {
            first_error
        };
        execution.finish(status, terminal_error);
        self.executions.update(execution.clone()).await?;
        self.publish_terminal(&execution);
        self.debugger.on_execution_terminal(execution.id);
        self.active.remove(&execution.id);
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            passed = passed,
            failed = failed,
            skipped = skipped,
            "execution finished"
        );
        Ok(execution)
    }

    fn publish_terminal(&self, execution: &Execution) {
        let event_type = match execution.status {
            ExecutionStatus::Completed => EventType::ExecutionCompleted,
            ExecutionStatus::Cancelled => EventType::ExecutionCancelled,
            _ => EventType::ExecutionFailed,
        };
        self.hub.publish(RunEvent::new(
            event_type,
            execution.id,
            json!({
                "status": execution.status,
                "passed_steps": execution.passed_steps,
                "failed_steps": execution.failed_steps,
                "skipped_steps": execution.skipped_steps,
                "duration_ms": execution.duration_ms,
                "error": execution.error,
            }),
        ));
    }

    /// Executes one step at any nesting depth.
    fn run_step<'a>(
        &'a self,
        info: &'a RunInfo,
        ctx: &'a ExecutionContext,
        scope: &'a mut Scope,
        step: &'a Step,
        depth: usize,
        body_level: bool,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            if ctx.is_cancelled() {
                return StepOutcome::cancelled(
                    ctx.cancel_reason().unwrap_or(CancelReason::ParentFailed),
                );
            }

            // 1. Guard.
            if let Some(guard) = &step.when {
                match expr::evaluate_guard(guard, scope, &self.funcs) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step_id = %step.id, "guard falsy, skipping");
                        self.persist_skipped(info, step).await;
                        self.publish_step_event(info.execution_id, EventType::StepSkipped, step, None);
                        return StepOutcome::skipped();
                    }
                    Err(err) => {
                        return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
                    }
                }
            }

            // 2. Debugger hook, with a best-effort resolved preview of the
            // input for the pause snapshot.
            let preview = expr::resolve_value(&step.config, scope, &self.funcs)
                .unwrap_or_else(|_| step.config.clone());
            if let Err(err) = self
                .debugger
                .before_step(info.execution_id, step, &preview, scope, &self.funcs, body_level)
                .await
            {
                return StepOutcome::cancelled(match err {
                    FlowError::Cancelled(reason) => reason,
                    _ => CancelReason::DebuggerStop,
                });
            }

            self.publish_step_event(info.execution_id, EventType::StepStarted, step, None);

            // 3/4. Resolve and dispatch.
            let outcome = match step.action {
                ActionKind::Wait => self.run_wait(info, ctx, scope, step).await,
                ActionKind::Condition => self.run_condition(info, ctx, scope, step, depth).await,
                ActionKind::Parallel => self.run_parallel(info, ctx, scope, step, depth).await,
                ActionKind::ForEach => self.run_for_each(info, ctx, scope, step, depth).await,
                ActionKind::SubFlow => self.run_sub_flow(info, ctx, scope, step, depth).await,
                _ => self.run_terminal(info, ctx, scope, step).await,
            };

            // Error/assertion breakpoints fire after dispatch and pause
            // before the next step.
            if outcome.state == StepState::Failed {
                let assertion_failed = outcome
                    .error
                    .as_ref()
                    .map(|e| e.kind == flowmesh_core::ErrorKind::AssertionFailed)
                    .unwrap_or(false);
                self.debugger
                    .after_step_failure(info.execution_id, !assertion_failed, assertion_failed);
            }
            outcome
        }
        .boxed()
    }

    /// Terminal protocol action: resolve, dispatch with retry/timeout,
    /// assert, bind.
    async fn run_terminal(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
    ) -> StepOutcome {
        let step_name = step.name.clone().unwrap_or_else(|| step.id.clone());

        // Resolution failures fail the step before anything is dispatched.
        let resolved = match expr::resolve_value(&step.config, scope, &self.funcs) {
            Ok(v) => v,
            Err(err) => return self.fail_step(info, ctx, scope, step, &err, Value::Null).await,
        };

        let handler = match self.registry.get(step.action) {
            Ok(h) => h,
            Err(err) => return self.fail_step(info, ctx, scope, step, &err, resolved).await,
        };

        let timeout_ms = step
            .timeout
            .or(info.flow_timeout)
            .unwrap_or(self.config.default_timeout_ms);
        let retry = step
            .retry
            .clone()
            .or_else(|| info.flow_retry.clone())
            .unwrap_or_default();
        let max_attempts = retry.max_attempts.max(1);

        let mut attempt: u32 = 1;
        loop {
            let mut record =
                StepExecution::start(info.execution_id, &step.id, &step_name, attempt);
            record.input = resolved.clone();

            let step_ctx = StepContext {
                execution: ctx.clone(),
                step_id: step.id.clone(),
                timeout: Duration::from_millis(timeout_ms),
            };
            let started = Instant::now();
            let result = tokio::select! {
                _ = ctx.cancellation().cancelled() => Err(FlowError::Cancelled(
                    ctx.cancel_reason().unwrap_or(CancelReason::UserCancelled),
                )),
                dispatched = tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    handler.execute(&step_ctx, resolved.clone(), scope),
                ) => match dispatched {
                    Ok(inner) => inner,
                    Err(_) => Err(FlowError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        budget_ms: timeout_ms,
                    }),
                },
            };

            match result {
                Ok(output) => {
                    return self
                        .finish_terminal(info, scope, step, record, output)
                        .await;
                }
                Err(err) if err.is_cancelled() => {
                    record.finish(StepState::Cancelled, Some(ErrorDetail::from(&err)));
                    self.persist_step(record).await;
                    self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(&err));
                    return StepOutcome::cancelled(match err {
                        FlowError::Cancelled(reason) => reason,
                        _ => CancelReason::UserCancelled,
                    });
                }
                Err(err) if err.retryable() && attempt < max_attempts => {
                    warn!(
                        step_id = %step.id,
                        attempt = attempt,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    record.finish(StepState::Failed, Some(ErrorDetail::from(&err)));
                    self.persist_step(record).await;

                    let backoff = retry.backoff_for_attempt(attempt);
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => {
                            return StepOutcome::cancelled(
                                ctx.cancel_reason().unwrap_or(CancelReason::UserCancelled),
                            );
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    record.finish(StepState::Failed, Some(ErrorDetail::from(&err)));
                    self.persist_step(record).await;
                    self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(&err));
                    return StepOutcome::failed(&err);
                }
            }
        }
    }

    /// Assertions, `save` bindings, persistence, and events for a
    /// successful dispatch.
    async fn finish_terminal(
        &self,
        info: &RunInfo,
        scope: &mut Scope,
        step: &Step,
        mut record: StepExecution,
        output: ActionOutput,
    ) -> StepOutcome {
        record.output = output.output.clone();
        record.artifacts = output.artifacts;
        let duration_ms = record
            .started_at
            .map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let assertion_ctx = AssertionContext {
            output: &output.output,
            duration_ms,
            scope,
            funcs: &self.funcs,
        };
        let results = evaluate_assertions(&step.assertions, &assertion_ctx);
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{}: {}", r.kind, r.message))
            .collect();
        record.assertion_results = results;

        // Bind `save` mappings plus the raw output under steps.<id>.
        let body_root = output.output.get("body").unwrap_or(&output.output);
        let mut bindings = Map::new();
        bindings.insert("output".to_string(), output.output.clone());
        for (name, path) in &step.save {
            match extract_path(body_root, path) {
                Ok(Some(v)) => {
                    bindings.insert(name.clone(), v);
                }
                Ok(None) => {
                    let err = FlowError::UndefinedReference(format!(
                        "save binding '{name}': path '{path}' not found in output"
                    ));
                    record.finish(StepState::Failed, Some(ErrorDetail::from(&err)));
                    self.persist_step(record).await;
                    self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(&err));
                    return StepOutcome::failed(&err);
                }
                Err(err) => {
                    record.finish(StepState::Failed, Some(ErrorDetail::from(&err)));
                    self.persist_step(record).await;
                    self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(&err));
                    return StepOutcome::failed(&err);
                }
            }
        }
        let bindings = Value::Object(bindings);
        scope.bind_step(&step.id, bindings.clone());

        if failed.is_empty() {
            record.finish(StepState::Passed, None);
            self.persist_step(record).await;
            self.publish_step_event(info.execution_id, EventType::StepCompleted, step, None);
            StepOutcome {
                state: StepState::Passed,
                error: None,
                bindings: Some((step.id.clone(), bindings)),
            }
        } else {
            let err = FlowError::AssertionFailed(failed.join("; "));
            record.finish(StepState::Failed, Some(ErrorDetail::from(&err)));
            self.persist_step(record).await;
            self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(&err));
            StepOutcome {
                state: StepState::Failed,
                error: Some(ErrorDetail::from(&err)),
                bindings: Some((step.id.clone(), bindings)),
            }
        }
    }

    /// Pure delay observing cancellation.
    async fn run_wait(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
    ) -> StepOutcome {
        let resolved = match expr::resolve_value(&step.config, scope, &self.funcs) {
            Ok(v) => v,
            Err(err) => return self.fail_step(info, ctx, scope, step, &err, Value::Null).await,
        };
        let cfg: WaitConfig = match serde_json::from_value(resolved.clone()) {
            Ok(c) => c,
            Err(e) => {
                let err = FlowError::InvalidDefinition(format!("wait config: {e}"));
                return self.fail_step(info, ctx, scope, step, &err, resolved).await;
            }
        };
        let mut record = StepExecution::start(
            info.execution_id,
            &step.id,
            step.name.as_deref().unwrap_or(&step.id),
            1,
        );
        record.input = resolved;

        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                let reason = ctx.cancel_reason().unwrap_or(CancelReason::UserCancelled);
                let err = FlowError::Cancelled(reason);
                record.finish(StepState::Cancelled, Some(ErrorDetail::from(&err)));
                self.persist_step(record).await;
                return StepOutcome::cancelled(reason);
            }
            _ = tokio::time::sleep(Duration::from_millis(cfg.duration)) => {}
        }

        record.finish(StepState::Passed, None);
        self.persist_step(record).await;
        self.publish_step_event(info.execution_id, EventType::StepCompleted, step, None);
        StepOutcome { state: StepState::Passed, error: None, bindings: None }
    }

    /// `condition`: pick a branch and run it sequentially.
    async fn run_condition(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
        depth: usize,
    ) -> StepOutcome {
        let cfg: ConditionConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                let err = FlowError::InvalidDefinition(format!("condition config: {e}"));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };
        let branch = match expr::evaluate_guard(&cfg.condition, scope, &self.funcs) {
            Ok(true) => &cfg.then,
            Ok(false) => &cfg.otherwise,
            Err(err) => {
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        let summary = self.run_step_list(info, ctx, scope, branch, depth).await;
        self.finish_construct(info, step, summary, json!({"branch_steps": branch.len()}))
            .await
    }

    /// `parallel`: spawn each child as a subtask; wait for all, or the
    /// first failure when `fail_fast` is set. Events publish in completion
    /// order; outputs merge into the parent scope at the single join point.
    async fn run_parallel(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
        depth: usize,
    ) -> StepOutcome {
        let cfg: ParallelConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                let err = FlowError::InvalidDefinition(format!("parallel config: {e}"));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        // Siblings share one derived context so fail_fast cancels only
        // this block, not the whole execution.
        let sibling_ctx = ctx.child();
        let mut join_set = JoinSet::new();
        for child in cfg.steps.clone() {
            let interp = self.clone();
            let child_info = info.clone();
            let child_ctx = sibling_ctx.clone();
            let mut child_scope = scope.clone();
            child_scope.push_frame(Map::new());
            join_set.spawn(async move {
                let outcome = interp
                    .run_step(&child_info, &child_ctx, &mut child_scope, &child, depth + 1, false)
                    .await;
                outcome
            });
        }

        let mut child_states: Vec<StepState> = Vec::new();
        let mut first_error: Option<ErrorDetail> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(step_id = %step.id, error = %e, "parallel child panicked");
                    StepOutcome::failed(&FlowError::handler(format!("child task failed: {e}")))
                }
            };
            if outcome.state == StepState::Failed {
                if first_error.is_none() {
                    first_error = outcome.error.clone();
                }
                if cfg.fail_fast {
                    sibling_ctx.cancel(CancelReason::ParentFailed);
                }
            }
            // The single serializing point: merge child outputs before the
            // post-parallel step reads them.
            if let Some((id, bindings)) = outcome.bindings {
                scope.bind_step(&id, bindings);
            }
            child_states.push(outcome.state);
        }

        let any_failed = child_states.iter().any(|s| *s == StepState::Failed);
        let state = if ctx.is_cancelled() {
            StepState::Cancelled
        } else if any_failed {
            StepState::Failed
        } else {
            StepState::Passed
        };
        let summary = ListSummary { state, error: first_error };
        self.finish_construct(info, step, summary, json!({"children": child_states}))
            .await
    }

    /// `for_each`: resolve items, run children once per element with an
    /// `iteration` scope frame.
    async fn run_for_each(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
        depth: usize,
    ) -> StepOutcome {
        let cfg: ForEachConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                let err = FlowError::InvalidDefinition(format!("for_each config: {e}"));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        let items = match expr::resolve_value(&cfg.items, scope, &self.funcs) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                let err = FlowError::TypeError(format!(
                    "for_each items must resolve to a list, got {}",
                    flowmesh_core::value::type_name(&other)
                ));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
            Err(err) => {
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        let total = items.len();
        let mut state = StepState::Passed;
        let mut first_error: Option<ErrorDetail> = None;
        for (index, item) in items.into_iter().enumerate() {
            if ctx.is_cancelled() {
                state = StepState::Cancelled;
                break;
            }
            let mut frame = Map::new();
            frame.insert(
                "iteration".to_string(),
                json!({"index": index, "value": item, "total": total}),
            );
            scope.push_frame(frame);
            let summary = self.run_step_list(info, ctx, scope, &cfg.steps, depth).await;
            scope.pop_frame();

            match summary.state {
                StepState::Failed => {
                    if first_error.is_none() {
                        first_error = summary.error;
                    }
                    if step.continue_on_error {
                        continue;
                    }
                    state = StepState::Failed;
                    break;
                }
                StepState::Cancelled => {
                    state = StepState::Cancelled;
                    break;
                }
                _ => {}
            }
        }
        if state == StepState::Passed && first_error.is_some() {
            // continue_on_error swallowed iteration failures.
            state = StepState::Failed;
        }
        let summary = ListSummary { state, error: first_error };
        self.finish_construct(info, step, summary, json!({"iterations": total}))
            .await
    }

    /// `sub_flow`: run another flow's steps in a fresh scope seeded with
    /// resolved inputs. Depth is capped; exceeding it is a `cycle` error.
    async fn run_sub_flow(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        step: &Step,
        depth: usize,
    ) -> StepOutcome {
        if depth + 1 > self.config.max_subflow_depth {
            let err = FlowError::Cycle(depth + 1);
            return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
        }
        let cfg: SubFlowConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                let err = FlowError::InvalidDefinition(format!("sub_flow config: {e}"));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        let flow = match self.flows.get(info.workspace_id, cfg.flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                let err = FlowError::NotFound(format!("sub-flow {}", cfg.flow_id));
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
            Err(err) => {
                return self.fail_step(info, ctx, scope, step, &err, Value::Null).await;
            }
        };

        let inputs = match expr::resolve_value(&Value::Object(cfg.inputs), scope, &self.funcs) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => Map::new(),
        };

        // The sub-flow gets its own scope frame stack: parent env, the
        // sub-flow's defaults overridden by the call-site inputs, and a
        // fresh steps namespace.
        let mut vars = flow.definition.variables.clone();
        for (k, v) in inputs {
            vars.insert(k, v);
        }
        let mut inner_scope = Scope::new();
        inner_scope.set_root(
            "env",
            scope.lookup("env").cloned().unwrap_or(Value::Object(Map::new())),
        );
        inner_scope.set_root("vars", Value::Object(vars));
        inner_scope.set_root("steps", Value::Object(Map::new()));

        let inner_info = RunInfo {
            execution_id: info.execution_id,
            workspace_id: info.workspace_id,
            flow_timeout: flow.definition.timeout,
            flow_retry: flow.definition.retry.clone(),
        };
        let mut summary = ListSummary { state: StepState::Passed, error: None };
        for child in &flow.definition.steps {
            let outcome = self
                .run_step(&inner_info, ctx, &mut inner_scope, child, depth + 1, false)
                .await;
            match outcome.state {
                StepState::Failed if !child.continue_on_error => {
                    summary = ListSummary { state: StepState::Failed, error: outcome.error };
                    break;
                }
                StepState::Failed => {
                    if summary.error.is_none() {
                        summary.error = outcome.error;
                    }
                }
                StepState::Cancelled => {
                    summary = ListSummary { state: StepState::Cancelled, error: outcome.error };
                    break;
                }
                _ => {}
            }
        }

        // Exported output: the sub-flow's step bindings; `save` selects
        // from them.
        let inner_steps = inner_scope
            .lookup("steps")
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        let output = json!({"steps": inner_steps});
        self.finish_construct(info, step, summary, output).await
    }

    /// Runs a child list sequentially, honoring per-child
    /// `continue_on_error`.
    async fn run_step_list(
        &self,
        info: &RunInfo,
        ctx: &ExecutionContext,
        scope: &mut Scope,
        steps: &[Step],
        depth: usize,
    ) -> ListSummary {
        let mut summary = ListSummary { state: StepState::Passed, error: None };
        for child in steps {
            let outcome = self.run_step(info, ctx, scope, child, depth + 1, false).await;
            match outcome.state {
                StepState::Failed => {
                    if summary.error.is_none() {
                        summary.error = outcome.error;
                    }
                    if !child.continue_on_error {
                        summary.state = StepState::Failed;
                        return summary;
                    }
                    summary.state = StepState::Failed;
                }
                StepState::Cancelled => {
                    summary.state = StepState::Cancelled;
                    summary.error = outcome.error;
                    return summary;
                }
                _ => {}
            }
        }
        summary
    }

    /// Persists and publishes the record for a control-flow construct.
    async fn finish_construct(
        &self,
        info: &RunInfo,
        step: &Step,
        summary: ListSummary,
        output: Value,
    ) -> StepOutcome {
        let mut record = StepExecution::start(
            info.execution_id,
            &step.id,
            step.name.as_deref().unwrap_or(&step.id),
            1,
        );
        record.input = step.config.clone();
        record.output = output.clone();
        record.finish(summary.state, summary.error.clone());
        self.persist_step(record).await;

        let (event_type, error) = match summary.state {
            StepState::Failed => (
                EventType::StepFailed,
                summary.error.clone().map(|e| FlowError::handler(e.message)),
            ),
            StepState::Cancelled => (EventType::StepFailed, None),
            _ => (EventType::StepCompleted, None),
        };
        self.publish_step_event(info.execution_id, event_type, step, error.as_ref());

        StepOutcome {
            state: summary.state,
            error: summary.error,
            bindings: Some((step.id.clone(), json!({"output": output}))),
        }
    }

    /// Records a pre-dispatch failure (resolution, config, lookup).
    async fn fail_step(
        &self,
        info: &RunInfo,
        _ctx: &ExecutionContext,
        _scope: &mut Scope,
        step: &Step,
        err: &FlowError,
        input: Value,
    ) -> StepOutcome {
        error!(step_id = %step.id, error = %err, "step failed before dispatch");
        let mut record = StepExecution::start(
            info.execution_id,
            &step.id,
            step.name.as_deref().unwrap_or(&step.id),
            1,
        );
        record.input = input;
        record.finish(StepState::Failed, Some(ErrorDetail::from(err)));
        self.persist_step(record).await;
        self.publish_step_event(info.execution_id, EventType::StepFailed, step, Some(err));
        StepOutcome::failed(err)
    }

    async fn persist_skipped(&self, info: &RunInfo, step: &Step) {
        let mut record = StepExecution::start(
            info.execution_id,
            &step.id,
            step.name.as_deref().unwrap_or(&step.id),
            1,
        );
        record.finish(StepState::Skipped, None);
        self.persist_step(record).await;
    }

    async fn persist_step(&self, record: StepExecution) {
        if let Err(e) = self.steps.append(record).await {
            // History lives in the step store; a failed write is loud but
            // does not abort the run.
            error!(error = %e, "failed to persist step record");
        }
    }

    fn publish_step_event(
        &self,
        execution_id: Uuid,
        event_type: EventType,
        step: &Step,
        error: Option<&FlowError>,
    ) {
        let payload = match error {
            Some(err) => json!({
                "step_id": step.id,
                "action": step.action,
                "error": ErrorDetail::from(err),
            }),
            None => json!({"step_id": step.id, "action": step.action}),
        };
        self.hub
            .publish(RunEvent::new(event_type, execution_id, payload));
    }
}

/// Aggregate result of a sequential child list.
#[derive(Debug)]
struct ListSummary {
    state: StepState,
    error: Option<ErrorDetail>,
}
