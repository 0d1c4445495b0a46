// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Run-launching seam between triggers and the engine.

use async_trait::async_trait;
use flowmesh_core::model::{ExecutionStatus, TriggerSource};
use flowmesh_core::Result;
use flowmesh_engine::Runtime;
use serde_json::{Map, Value};
use uuid::Uuid;

/// How the scheduler and webhook dispatcher start runs.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Starts an execution of a flow and returns its id.
    async fn launch(
        &self,
        workspace_id: Uuid,
        flow_id: Uuid,
        variables: Map<String, Value>,
        trigger: TriggerSource,
    ) -> Result<Uuid>;

    /// Current status of an execution, `None` when unknown.
    async fn status(&self, execution_id: Uuid) -> Result<Option<ExecutionStatus>>;

    /// Whether an execution is still pending, running, or paused.
    async fn is_active(&self, execution_id: Uuid) -> Result<bool> {
        Ok(matches!(
            self.status(execution_id).await?,
            Some(ExecutionStatus::Pending)
                | Some(ExecutionStatus::Running)
                | Some(ExecutionStatus::Paused)
        ))
    }
}

#[async_trait]
impl RunLauncher for Runtime {
    async fn launch(
        &self,
        workspace_id: Uuid,
        flow_id: Uuid,
        variables: Map<String, Value>,
        trigger: TriggerSource,
    ) -> Result<Uuid> {
        self.create_execution(workspace_id, flow_id, None, variables, trigger)
            .await
    }

    async fn status(&self, execution_id: Uuid) -> Result<Option<ExecutionStatus>> {
        match self.get_execution(execution_id).await {
            Ok(execution) => Ok(Some(execution.status)),
            Err(_) => Ok(None),
        }
    }
}
