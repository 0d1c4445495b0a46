// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Narrow persistence interfaces the core depends on.
//!
//! Exact storage is out of scope; the runtime only ever talks to these
//! traits. Write failures surface as `persistence_error` and are retried
//! with a bounded attempt count by callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowmesh_core::model::{
    Execution, ExecutionStatus, FlowRecord, GitTriggerRule, LoadTestResult, Schedule,
    StepExecution, WebhookDelivery,
};
use flowmesh_core::Result;
use uuid::Uuid;

/// Filter for execution listings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Flow definitions, scoped by workspace.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn put(&self, flow: FlowRecord) -> Result<()>;
    /// Workspace-scoped lookup; a flow outside the caller's workspace is
    /// indistinguishable from a missing one.
    async fn get(&self, workspace_id: Uuid, flow_id: Uuid) -> Result<Option<FlowRecord>>;
    async fn list(&self, workspace_id: Uuid) -> Result<Vec<FlowRecord>>;
    async fn delete(&self, workspace_id: Uuid, flow_id: Uuid) -> Result<()>;
}

/// Execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: Execution) -> Result<()>;
    async fn update(&self, execution: Execution) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn list(&self, filter: ExecutionFilter) -> Result<Vec<Execution>>;
}

/// Step execution records; append-only.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn append(&self, step: StepExecution) -> Result<()>;
    async fn list_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>>;
}

/// Schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn put(&self, schedule: Schedule) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Schedule>>;
    async fn list(&self) -> Result<Vec<Schedule>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Git trigger rules.
#[async_trait]
pub trait TriggerRuleStore: Send + Sync {
    async fn put(&self, rule: GitTriggerRule) -> Result<()>;
    async fn list_enabled(&self) -> Result<Vec<GitTriggerRule>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Webhook delivery audit records; immutable once written.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, delivery: WebhookDelivery) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>>;
    /// Lookup used for `(provider, delivery_id)` deduplication.
    async fn find_by_delivery_id(
        &self,
        provider: &str,
        delivery_id: &str,
    ) -> Result<Option<WebhookDelivery>>;
    async fn list(&self) -> Result<Vec<WebhookDelivery>>;
}

/// Load-test results.
#[async_trait]
pub trait LoadTestStore: Send + Sync {
    async fn insert(&self, result: LoadTestResult) -> Result<()>;
    async fn update(&self, result: LoadTestResult) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<LoadTestResult>>;
}

/// Opaque content storage for large artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores a payload, returning its content reference.
    async fn put(&self, data: Vec<u8>) -> Result<String>;
    async fn get(&self, content_ref: &str) -> Result<Option<Vec<u8>>>;
}
