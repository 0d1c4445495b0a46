// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Execution and step-execution records.

use crate::assertion::AssertionResult;
use crate::definition::FlowDefinition;
use crate::error::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Execution lifecycle status.
///
/// Transitions form the DAG `pending → running → (paused ↔ running) →
/// (completed | failed | cancelled)`; terminal statuses are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// True for completed, failed, and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the status DAG permits moving to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid execution status: {s}")),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ref")]
pub enum TriggerSource {
    /// Direct API call.
    Api,
    /// Fired by a cron schedule.
    Schedule(Uuid),
    /// Fired by a webhook delivery.
    Webhook(Uuid),
    /// One iteration of a collection run.
    Collection(Uuid),
}

/// One run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: Uuid,
    /// The flow this execution runs.
    pub flow_id: Uuid,
    /// Workspace scope; lookups are always workspace-scoped.
    pub workspace_id: Uuid,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Named target environment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// What started the run.
    pub trigger: TriggerSource,
    /// Immutable snapshot of the definition used for this run.
    pub definition: FlowDefinition,
    /// Runtime variable overrides supplied by the trigger.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time, `finished_at - started_at`.
    pub duration_ms: u64,
    pub total_steps: u32,
    pub passed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    /// First non-cancelled step error, when the execution failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl Execution {
    /// Creates a pending execution for a trigger.
    pub fn new(
        flow_id: Uuid,
        workspace_id: Uuid,
        definition: FlowDefinition,
        trigger: TriggerSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            workspace_id,
            status: ExecutionStatus::Pending,
            environment: None,
            trigger,
            definition,
            variables: serde_json::Map::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            total_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            error: None,
        }
    }

    /// Sets the target environment.
    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    /// Sets runtime variable overrides.
    pub fn with_variables(mut self, variables: serde_json::Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Marks the execution running. No-op once terminal.
    pub fn mark_running(&mut self) {
        if self.status.can_transition_to(ExecutionStatus::Running)
            || self.status == ExecutionStatus::Pending
        {
            self.status = ExecutionStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Finishes the execution with the given terminal status.
    ///
    /// Terminal statuses are sticky: finishing an already-terminal
    /// execution is a no-op, which makes double-cancel idempotent.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<ErrorDetail>) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        self.status = status;
        let now = Utc::now();
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
        if self.error.is_none() {
            self.error = error;
        }
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One attempt of one step within an execution.
///
/// Step records are monotonically appended; a retried step persists one
/// record per attempt and the last attempt defines the final status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// The step's id within the flow definition.
    pub step_id: String,
    pub step_name: String,
    pub status: StepState,
    /// 1-based attempt counter.
    pub attempt_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Fully-resolved input config.
    pub input: Value,
    /// Captured output.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_results: Vec<AssertionResult>,
    /// Artifacts captured by this attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<crate::model::Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl StepExecution {
    /// Creates a running step record for an attempt.
    pub fn start(execution_id: Uuid, step_id: &str, step_name: &str, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepState::Running,
            attempt_number: attempt,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: 0,
            input: Value::Null,
            output: Value::Null,
            assertion_results: Vec::new(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    /// Finalizes the record with a terminal state.
    pub fn finish(&mut self, status: StepState, error: Option<ErrorDetail>) {
        self.status = status;
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
        self.finished_at = Some(now);
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> FlowDefinition {
        FlowDefinition::from_value(json!({
            "name": "t",
            "steps": [{"id": "a", "action": "wait", "config": {"duration": 1}}],
        }))
        .unwrap()
    }

    #[test]
    fn status_dag() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut execution =
            Execution::new(Uuid::new_v4(), Uuid::new_v4(), definition(), TriggerSource::Api);
        execution.mark_running();
        execution.finish(ExecutionStatus::Cancelled, None);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        // Double-cancel and late completion are no-ops.
        execution.finish(ExecutionStatus::Cancelled, None);
        execution.finish(ExecutionStatus::Completed, None);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn duration_is_non_negative() {
        let mut execution =
            Execution::new(Uuid::new_v4(), Uuid::new_v4(), definition(), TriggerSource::Api);
        execution.mark_running();
        execution.finish(ExecutionStatus::Completed, None);
        assert!(execution.finished_at.unwrap() >= execution.started_at.unwrap());
    }

    #[test]
    fn step_attempts_are_one_based() {
        let mut step = StepExecution::start(Uuid::new_v4(), "a", "a", 1);
        step.finish(StepState::Passed, None);
        assert_eq!(step.attempt_number, 1);
        assert!(step.status.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(ExecutionStatus::Cancelled).unwrap(), json!("cancelled"));
        assert_eq!(serde_json::to_value(StepState::Passed).unwrap(), json!("passed"));
    }
}
