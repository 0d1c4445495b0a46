// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Debugger controller.
//!
//! Sessions attach to a live execution and coordinate with the interpreter
//! through a pause gate: a zero-permit semaphore per execution. The
//! interpreter blocks on the gate when a pause decision fires; debugger
//! commands release it. Step-over is "release once, then re-arm".

use crate::context::ExecutionContext;
use crate::hub::EventHub;
use dashmap::DashMap;
use flowmesh_core::model::{
    Breakpoint, BreakpointKind, DebugSession, DebugState, EventType, RunEvent, StepSnapshot,
};
use flowmesh_core::{expr, CancelReason, FlowError, Functions, Result, Scope, Step};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

/// How long a stopped session is retained so clients can drain history.
pub const STOPPED_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(300);

struct SessionHandle {
    model: Mutex<DebugSession>,
    gate: Semaphore,
    /// Set by the pause command; consumed at the next hook.
    pause_requested: AtomicBool,
    /// Set by error/assertion breakpoints; pauses before the next step.
    pending_pause: AtomicBool,
    /// When the session stopped; drives TTL eviction.
    stopped_at: Mutex<Option<std::time::Instant>>,
}

/// Session lifecycle and breakpoint coordination.
#[derive(Default)]
pub struct DebuggerController {
    hub: EventHub,
    /// Session per execution; at most one.
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    /// session id → execution id.
    index: DashMap<Uuid, Uuid>,
    /// Execution contexts registered by the interpreter, for stop().
    executions: DashMap<Uuid, ExecutionContext>,
}

impl DebuggerController {
    pub fn new(hub: EventHub) -> Self {
        Self { hub, ..Default::default() }
    }

    /// Called by the interpreter when a run starts, so `stop` can cancel.
    pub fn register_execution(&self, ctx: ExecutionContext) {
        self.executions.insert(ctx.execution_id(), ctx);
    }

    /// Opens a session against an execution. At most one session may
    /// exist per execution; a second attach yields `conflict`.
    pub fn start(&self, execution_id: Uuid, flow_id: Uuid) -> Result<DebugSession> {
        if self.sessions.contains_key(&execution_id) {
            return Err(FlowError::Conflict(format!(
                "execution {execution_id} already has a debug session"
            )));
        }
        let session = DebugSession::new(execution_id, flow_id);
        let handle = Arc::new(SessionHandle {
            model: Mutex::new(session.clone()),
            gate: Semaphore::new(0),
            pause_requested: AtomicBool::new(false),
            pending_pause: AtomicBool::new(false),
            stopped_at: Mutex::new(None),
        });
        self.sessions.insert(execution_id, handle);
        self.index.insert(session.id, execution_id);
        info!(execution_id = %execution_id, session_id = %session.id, "debug session attached");
        Ok(session)
    }

    /// Ends a session, releasing the interpreter if it was paused.
    pub fn end(&self, session_id: Uuid) -> Result<()> {
        let execution_id = self.lookup(session_id)?;
        if let Some((_, handle)) = self.sessions.remove(&execution_id) {
            {
                let mut model = handle.model.lock();
                model.state = DebugState::Stopped;
            }
            handle.gate.add_permits(1);
        }
        self.index.remove(&session_id);
        Ok(())
    }

    /// Requests a pause before the next step.
    pub fn pause(&self, session_id: Uuid) -> Result<()> {
        let handle = self.handle_for(session_id)?;
        handle.pause_requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Resumes a paused execution.
    pub fn resume(&self, session_id: Uuid) -> Result<()> {
        let handle = self.handle_for(session_id)?;
        let execution_id;
        {
            let mut model = handle.model.lock();
            model.state = DebugState::Running;
            execution_id = model.execution_id;
        }
        self.hub.publish(RunEvent::new(
            EventType::DebugResumed,
            execution_id,
            json!({"session_id": session_id}),
        ));
        handle.gate.add_permits(1);
        Ok(())
    }

    /// Advances exactly one step (body granularity) and re-pauses.
    pub fn step_over(&self, session_id: Uuid) -> Result<()> {
        let handle = self.handle_for(session_id)?;
        let execution_id;
        {
            let mut model = handle.model.lock();
            model.state = DebugState::Stepping;
            execution_id = model.execution_id;
        }
        self.hub.publish(RunEvent::new(
            EventType::DebugResumed,
            execution_id,
            json!({"session_id": session_id, "stepping": true}),
        ));
        handle.gate.add_permits(1);
        Ok(())
    }

    /// Stops the session and cancels the execution.
    pub fn stop(&self, session_id: Uuid) -> Result<()> {
        let handle = self.handle_for(session_id)?;
        let execution_id;
        {
            let mut model = handle.model.lock();
            model.state = DebugState::Stopped;
            execution_id = model.execution_id;
        }
        *handle.stopped_at.lock() = Some(std::time::Instant::now());
        if let Some(ctx) = self.executions.get(&execution_id) {
            ctx.cancel(CancelReason::DebuggerStop);
        }
        self.hub.publish(RunEvent::new(
            EventType::DebugStopped,
            execution_id,
            json!({"session_id": session_id}),
        ));
        handle.gate.add_permits(1);
        Ok(())
    }

    /// Adds a breakpoint, returning its id.
    pub fn add_breakpoint(&self, session_id: Uuid, breakpoint: Breakpoint) -> Result<Uuid> {
        let handle = self.handle_for(session_id)?;
        let id = breakpoint.id;
        handle.model.lock().breakpoints.push(breakpoint);
        Ok(id)
    }

    /// Removes a breakpoint.
    pub fn remove_breakpoint(&self, session_id: Uuid, breakpoint_id: Uuid) -> Result<()> {
        let handle = self.handle_for(session_id)?;
        let mut model = handle.model.lock();
        let before = model.breakpoints.len();
        model.breakpoints.retain(|b| b.id != breakpoint_id);
        if model.breakpoints.len() == before {
            return Err(FlowError::NotFound(format!("breakpoint {breakpoint_id}")));
        }
        Ok(())
    }

    /// Toggles a breakpoint's enabled flag.
    pub fn toggle_breakpoint(&self, session_id: Uuid, breakpoint_id: Uuid) -> Result<bool> {
        let handle = self.handle_for(session_id)?;
        let mut model = handle.model.lock();
        let bp = model
            .breakpoints
            .iter_mut()
            .find(|b| b.id == breakpoint_id)
            .ok_or_else(|| FlowError::NotFound(format!("breakpoint {breakpoint_id}")))?;
        bp.enabled = !bp.enabled;
        Ok(bp.enabled)
    }

    /// Lists breakpoints.
    pub fn list_breakpoints(&self, session_id: Uuid) -> Result<Vec<Breakpoint>> {
        let handle = self.handle_for(session_id)?;
        let breakpoints = handle.model.lock().breakpoints.clone();
        Ok(breakpoints)
    }

    /// Current session snapshot.
    pub fn session(&self, session_id: Uuid) -> Result<DebugSession> {
        let handle = self.handle_for(session_id)?;
        let session = handle.model.lock().clone();
        Ok(session)
    }

    /// Session for an execution, if one is attached.
    pub fn session_for_execution(&self, execution_id: Uuid) -> Option<DebugSession> {
        self.sessions
            .get(&execution_id)
            .map(|handle| handle.model.lock().clone())
    }

    /// Hook consulted by the interpreter before dispatching a step.
    ///
    /// Blocks while paused. Returns an error only when the execution was
    /// cancelled (stop or external cancel) while waiting on the gate.
    pub async fn before_step(
        &self,
        execution_id: Uuid,
        step: &Step,
        input: &Value,
        scope: &Scope,
        funcs: &Functions,
        body_level: bool,
    ) -> Result<()> {
        let Some(handle) = self.sessions.get(&execution_id).map(|h| h.clone()) else {
            return Ok(());
        };

        let mut fired_breakpoint: Option<(Uuid, u32)> = None;
        let mut log_messages: Vec<String> = Vec::new();
        let mut should_pause = false;

        {
            let mut model = handle.model.lock();
            if model.state == DebugState::Stopped {
                return Ok(());
            }
            if model.state == DebugState::Idle {
                model.state = DebugState::Running;
            }
            let stepping = model.state == DebugState::Stepping;

            for bp in model.breakpoints.iter_mut().filter(|b| b.enabled) {
                let step_matches = bp
                    .step_id
                    .as_deref()
                    .map(|id| id == step.id)
                    .unwrap_or(bp.kind != BreakpointKind::Step);

                match (&bp.log_point, bp.kind) {
                    // Log-points emit and continue, never pause.
                    (Some(template), _) if step_matches => {
                        bp.hit_count += 1;
                        let rendered = expr::resolve_template(template, scope, funcs)
                            .map(|v| flowmesh_core::value::to_display_string(&v))
                            .unwrap_or_else(|_| template.clone());
                        log_messages.push(rendered);
                    }
                    (None, BreakpointKind::Step) if step_matches => {
                        bp.hit_count += 1;
                        fired_breakpoint = Some((bp.id, bp.hit_count));
                        should_pause = true;
                    }
                    (None, BreakpointKind::Conditional) if step_matches => {
                        if let Some(condition) = &bp.condition {
                            let mut cond_scope = scope.clone();
                            let mut frame = serde_json::Map::new();
                            frame.insert("hit_count".to_string(), json!(bp.hit_count));
                            cond_scope.push_frame(frame);
                            if expr::evaluate_guard(condition, &cond_scope, funcs).unwrap_or(false)
                            {
                                bp.hit_count += 1;
                                fired_breakpoint = Some((bp.id, bp.hit_count));
                                should_pause = true;
                            }
                        }
                    }
                    _ => {}
                }
            }

            // Stepping consumes exactly one body-level step.
            if stepping && body_level {
                should_pause = true;
            }
            if handle.pause_requested.swap(false, Ordering::AcqRel) {
                should_pause = true;
            }
            if handle.pending_pause.swap(false, Ordering::AcqRel) {
                should_pause = true;
            }

            if should_pause {
                model.state = DebugState::Paused;
                model.current_step = Some(step.id.clone());
                model.step_history.push(StepSnapshot {
                    step_id: step.id.clone(),
                    input: input.clone(),
                    variables: Value::Object(scope.flatten()),
                    captured_at: chrono::Utc::now(),
                });
            }
        }

        for message in log_messages {
            self.hub.publish(RunEvent::new(
                EventType::DebugLogPoint,
                execution_id,
                json!({"step_id": step.id, "message": message}),
            ));
        }

        if !should_pause {
            return Ok(());
        }

        if let Some((breakpoint_id, hit_count)) = fired_breakpoint {
            self.hub.publish(RunEvent::new(
                EventType::DebugBreakpointHit,
                execution_id,
                json!({
                    "breakpoint_id": breakpoint_id,
                    "step_id": step.id,
                    "hit_count": hit_count,
                }),
            ));
        }

        let snapshot = {
            let model = handle.model.lock();
            json!({
                "session_id": model.id,
                "step_id": step.id,
                "input": input,
                "variables": Value::Object(scope.flatten()),
            })
        };
        self.hub
            .publish(RunEvent::new(EventType::DebugPaused, execution_id, snapshot));
        debug!(execution_id = %execution_id, step_id = %step.id, "interpreter paused");

        // Block on the pause gate until a debugger command releases it.
        let cancellation = self
            .executions
            .get(&execution_id)
            .map(|ctx| ctx.cancellation().clone());
        match cancellation {
            Some(token) => {
                tokio::select! {
                    permit = handle.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    _ = token.cancelled() => {
                        return Err(FlowError::Cancelled(
                            self.executions
                                .get(&execution_id)
                                .and_then(|ctx| ctx.cancel_reason())
                                .unwrap_or(CancelReason::UserCancelled),
                        ));
                    }
                }
            }
            None => {
                if let Ok(permit) = handle.gate.acquire().await {
                    permit.forget();
                }
            }
        }

        let state = handle.model.lock().state;
        if state == DebugState::Stopped {
            return Err(FlowError::Cancelled(CancelReason::DebuggerStop));
        }
        Ok(())
    }

    /// Consulted after a step errored or failed assertions; a firing
    /// `error`/`assertion` breakpoint pauses before the next step.
    pub fn after_step_failure(&self, execution_id: Uuid, errored: bool, assertion_failed: bool) {
        let Some(handle) = self.sessions.get(&execution_id).map(|h| h.clone()) else {
            return;
        };
        let mut fired = Vec::new();
        {
            let mut model = handle.model.lock();
            for bp in model.breakpoints.iter_mut().filter(|b| b.enabled) {
                let matches = match bp.kind {
                    BreakpointKind::Error => errored,
                    BreakpointKind::Assertion => assertion_failed,
                    _ => false,
                };
                if matches && bp.log_point.is_none() {
                    bp.hit_count += 1;
                    fired.push((bp.id, bp.hit_count));
                }
            }
        }
        if !fired.is_empty() {
            handle.pending_pause.store(true, Ordering::Release);
            for (breakpoint_id, hit_count) in fired {
                self.hub.publish(RunEvent::new(
                    EventType::DebugBreakpointHit,
                    execution_id,
                    json!({"breakpoint_id": breakpoint_id, "hit_count": hit_count}),
                ));
            }
        }
    }

    /// Marks the session stopped when its execution reaches a terminal
    /// state. The session is retained for [`STOPPED_SESSION_TTL`] so the
    /// client can drain history; `end` or `evict_stopped` removes it.
    pub fn on_execution_terminal(&self, execution_id: Uuid) {
        self.executions.remove(&execution_id);
        if let Some(handle) = self.sessions.get(&execution_id).map(|h| h.clone()) {
            let session_id;
            {
                let mut model = handle.model.lock();
                if model.state == DebugState::Stopped {
                    return;
                }
                model.state = DebugState::Stopped;
                session_id = model.id;
            }
            *handle.stopped_at.lock() = Some(std::time::Instant::now());
            self.hub.publish(RunEvent::new(
                EventType::DebugStopped,
                execution_id,
                json!({"session_id": session_id, "reason": "execution_terminal"}),
            ));
            handle.gate.add_permits(1);
        }
    }

    /// Removes stopped sessions older than the TTL. Called periodically by
    /// the hosting process.
    pub fn evict_stopped(&self) {
        let mut evict = Vec::new();
        for entry in self.sessions.iter() {
            let handle = entry.value();
            let expired = handle
                .stopped_at
                .lock()
                .map(|t| t.elapsed() >= STOPPED_SESSION_TTL)
                .unwrap_or(false);
            if expired {
                let session_id = handle.model.lock().id;
                evict.push((*entry.key(), session_id));
            }
        }
        for (execution_id, session_id) in evict {
            self.sessions.remove(&execution_id);
            self.index.remove(&session_id);
            info!(execution_id = %execution_id, "stopped debug session evicted");
        }
    }

    fn lookup(&self, session_id: Uuid) -> Result<Uuid> {
        self.index
            .get(&session_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| FlowError::NotFound(format!("debug session {session_id}")))
    }

    fn handle_for(&self, session_id: Uuid) -> Result<Arc<SessionHandle>> {
        let execution_id = self.lookup(session_id)?;
        self.sessions
            .get(&execution_id)
            .map(|h| h.clone())
            .ok_or_else(|| FlowError::NotFound(format!("debug session {session_id}")))
    }
}
