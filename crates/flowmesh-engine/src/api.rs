// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Runtime facade: the operation surface triggers, the CLI, and tests
//! call into. Wraps the interpreter, the debugger controller, and the
//! stores behind the operations of the platform API.

use crate::debug::DebuggerController;
use crate::hub::{EventHub, Subscription};
use crate::interpreter::FlowInterpreter;
use flowmesh_core::model::{DebugSession, Execution, ExecutionStatus, StepExecution, TriggerSource};
use flowmesh_core::{CancelReason, ErrorDetail, FlowError, Result};
use flowmesh_state::{ExecutionFilter, ExecutionStore, FlowStore, StepStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;
use uuid::Uuid;

/// Default worker pool size: concurrent executions per process.
pub const DEFAULT_WORKERS: usize = 16;

/// Single-process runtime.
#[derive(Clone)]
pub struct Runtime {
    interpreter: FlowInterpreter,
    debugger: Arc<DebuggerController>,
    flows: Arc<dyn FlowStore>,
    executions: Arc<dyn ExecutionStore>,
    steps: Arc<dyn StepStore>,
    workers: Arc<Semaphore>,
}

impl Runtime {
    pub fn new(
        interpreter: FlowInterpreter,
        debugger: Arc<DebuggerController>,
        flows: Arc<dyn FlowStore>,
        executions: Arc<dyn ExecutionStore>,
        steps: Arc<dyn StepStore>,
    ) -> Self {
        Self {
            interpreter,
            debugger,
            flows,
            executions,
            steps,
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
        }
    }

    /// Overrides the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    pub fn hub(&self) -> &EventHub {
        self.interpreter.hub()
    }

    pub fn debugger(&self) -> &DebuggerController {
        &self.debugger
    }

    pub fn interpreter(&self) -> &FlowInterpreter {
        &self.interpreter
    }

    /// `execution.create`: snapshots the flow definition and queues a run.
    ///
    /// The flow lookup is workspace-scoped; an execution is never
    /// dispatched against a flow the caller cannot see.
    pub async fn create_execution(
        &self,
        workspace_id: Uuid,
        flow_id: Uuid,
        environment: Option<String>,
        variables: Map<String, Value>,
        trigger: TriggerSource,
    ) -> Result<Uuid> {
        let flow = self
            .flows
            .get(workspace_id, flow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("flow {flow_id}")))?;

        let execution = Execution::new(flow_id, workspace_id, flow.definition, trigger)
            .with_environment(environment)
            .with_variables(variables);
        let execution_id = execution.id;
        self.executions.insert(execution.clone()).await?;

        let interpreter = self.interpreter.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            // One worker owns at most one execution at a time.
            let _permit = workers.acquire_owned().await;
            let _ = interpreter.run(execution, Map::new()).await;
        });
        info!(execution_id = %execution_id, flow_id = %flow_id, "execution queued");
        Ok(execution_id)
    }

    /// Runs an execution inline and returns its terminal record. Used by
    /// the CLI and the collection runner.
    pub async fn run_inline(
        &self,
        execution: Execution,
        env: Map<String, Value>,
    ) -> Result<Execution> {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FlowError::Capacity("worker pool closed".into()))?;
        self.interpreter.run(execution, env).await
    }

    /// `execution.cancel`: idempotent; a second cancel of the same
    /// execution is a no-op with the same terminal state.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<()> {
        self.interpreter.cancel(execution_id, CancelReason::UserCancelled);

        // An execution that never started still needs its record closed.
        if let Some(mut execution) = self.executions.get(execution_id).await? {
            if execution.status == ExecutionStatus::Pending {
                execution.finish(
                    ExecutionStatus::Cancelled,
                    Some(ErrorDetail::from(&FlowError::Cancelled(
                        CancelReason::UserCancelled,
                    ))),
                );
                self.executions.update(execution).await?;
            }
        }
        Ok(())
    }

    /// `execution.get`.
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {execution_id}")))
    }

    /// `execution.list`.
    pub async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        self.executions.list(filter).await
    }

    /// `execution.steps`.
    pub async fn get_steps(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        self.steps.list_for_execution(execution_id).await
    }

    /// `debug.start`.
    pub fn debug_start(&self, execution_id: Uuid, flow_id: Uuid) -> Result<DebugSession> {
        self.debugger.start(execution_id, flow_id)
    }

    /// `debug.end`.
    pub fn debug_end(&self, session_id: Uuid) -> Result<()> {
        self.debugger.end(session_id)
    }

    /// Subscribes to one execution's live events.
    pub fn subscribe(&self, execution_id: Uuid) -> Subscription {
        self.hub().subscribe(execution_id)
    }
}
