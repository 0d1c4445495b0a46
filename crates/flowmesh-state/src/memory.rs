// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! In-memory store implementations.
//!
//! Used by tests and single-process deployments. Every store is cheap to
//! clone and safe for concurrent use.

use crate::stores::{
    ArtifactStore, DeliveryStore, ExecutionFilter, ExecutionStore, FlowStore, LoadTestStore,
    ScheduleStore, StepStore, TriggerRuleStore,
};
use async_trait::async_trait;
use flowmesh_core::model::{
    Execution, FlowRecord, GitTriggerRule, LoadTestResult, Schedule, StepExecution,
    WebhookDelivery,
};
use flowmesh_core::{FlowError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory flow store keyed by `(workspace, flow-id)`.
#[derive(Clone, Default)]
pub struct InMemoryFlowStore {
    inner: Arc<RwLock<HashMap<(Uuid, Uuid), FlowRecord>>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn put(&self, flow: FlowRecord) -> Result<()> {
        self.inner.write().insert((flow.workspace_id, flow.id), flow);
        Ok(())
    }

    async fn get(&self, workspace_id: Uuid, flow_id: Uuid) -> Result<Option<FlowRecord>> {
        Ok(self.inner.read().get(&(workspace_id, flow_id)).cloned())
    }

    async fn list(&self, workspace_id: Uuid) -> Result<Vec<FlowRecord>> {
        Ok(self
            .inner
            .read()
            .values()
            .filter(|f| f.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, workspace_id: Uuid, flow_id: Uuid) -> Result<()> {
        self.inner.write().remove(&(workspace_id, flow_id));
        Ok(())
    }
}

/// In-memory execution store.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    inner: Arc<RwLock<HashMap<Uuid, Execution>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: Execution) -> Result<()> {
        self.inner.write().insert(execution.id, execution);
        Ok(())
    }

    async fn update(&self, execution: Execution) -> Result<()> {
        let mut guard = self.inner.write();
        if !guard.contains_key(&execution.id) {
            return Err(FlowError::Persistence(format!(
                "execution {} does not exist",
                execution.id
            )));
        }
        guard.insert(execution.id, execution);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.inner.read().get(&id).cloned())
    }

    async fn list(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        let guard = self.inner.read();
        let mut out: Vec<Execution> = guard
            .values()
            .filter(|e| filter.flow_id.map(|id| e.flow_id == id).unwrap_or(true))
            .filter(|e| filter.status.map(|s| e.status == s).unwrap_or(true))
            .filter(|e| filter.since.map(|t| e.created_at >= t).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

/// In-memory append-only step store.
#[derive(Clone, Default)]
pub struct InMemoryStepStore {
    inner: Arc<RwLock<Vec<StepExecution>>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn append(&self, step: StepExecution) -> Result<()> {
        self.inner.write().push(step);
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

/// In-memory schedule store.
#[derive(Clone, Default)]
pub struct InMemoryScheduleStore {
    inner: Arc<RwLock<HashMap<Uuid, Schedule>>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn put(&self, schedule: Schedule) -> Result<()> {
        self.inner.write().insert(schedule.id, schedule);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.inner.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Schedule>> {
        Ok(self.inner.read().values().cloned().collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.write().remove(&id);
        Ok(())
    }
}

/// In-memory trigger rule store.
#[derive(Clone, Default)]
pub struct InMemoryTriggerRuleStore {
    inner: Arc<RwLock<HashMap<Uuid, GitTriggerRule>>>,
}

impl InMemoryTriggerRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerRuleStore for InMemoryTriggerRuleStore {
    async fn put(&self, rule: GitTriggerRule) -> Result<()> {
        self.inner.write().insert(rule.id, rule);
        Ok(())
    }

    async fn list_enabled(&self) -> Result<Vec<GitTriggerRule>> {
        Ok(self
            .inner
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.write().remove(&id);
        Ok(())
    }
}

/// In-memory delivery audit store.
#[derive(Clone, Default)]
pub struct InMemoryDeliveryStore {
    inner: Arc<RwLock<Vec<WebhookDelivery>>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, delivery: WebhookDelivery) -> Result<()> {
        self.inner.write().push(delivery);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        Ok(self.inner.read().iter().find(|d| d.id == id).cloned())
    }

    async fn find_by_delivery_id(
        &self,
        provider: &str,
        delivery_id: &str,
    ) -> Result<Option<WebhookDelivery>> {
        Ok(self
            .inner
            .read()
            .iter()
            .find(|d| {
                d.provider == provider && d.delivery_id.as_deref() == Some(delivery_id)
            })
            .cloned())
    }

    async fn list(&self) -> Result<Vec<WebhookDelivery>> {
        Ok(self.inner.read().clone())
    }
}

/// In-memory load-test result store.
#[derive(Clone, Default)]
pub struct InMemoryLoadTestStore {
    inner: Arc<RwLock<HashMap<Uuid, LoadTestResult>>>,
}

impl InMemoryLoadTestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadTestStore for InMemoryLoadTestStore {
    async fn insert(&self, result: LoadTestResult) -> Result<()> {
        self.inner.write().insert(result.id, result);
        Ok(())
    }

    async fn update(&self, result: LoadTestResult) -> Result<()> {
        self.inner.write().insert(result.id, result);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LoadTestResult>> {
        Ok(self.inner.read().get(&id).cloned())
    }
}

/// In-memory artifact blob store.
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, data: Vec<u8>) -> Result<String> {
        let content_ref = format!("mem://{}", Uuid::new_v4());
        self.inner.write().insert(content_ref.clone(), data);
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(content_ref).cloned())
    }
}
