// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Debug session and breakpoint models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Debug session state machine.
///
/// `idle → running ↔ paused → stepping → running | stopped`, with
/// `stopped` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugState {
    Idle,
    Running,
    Paused,
    Stepping,
    Stopped,
}

impl DebugState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for DebugState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stepping => write!(f, "stepping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Breakpoint discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    /// Fires on entry to the matching step.
    Step,
    /// Fires when the condition evaluates truthy against the current scope.
    Conditional,
    /// Fires whenever a step errors.
    Error,
    /// Fires whenever an assertion fails.
    Assertion,
}

/// One breakpoint within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: Uuid,
    /// Step the breakpoint is attached to; `None` matches any step for
    /// conditional/error/assertion kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: BreakpointKind,
    /// Expression for `conditional` breakpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Log template; a breakpoint carrying one never pauses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_point: Option<String>,
    pub enabled: bool,
    /// Times this breakpoint has fired; conditions may reference it.
    pub hit_count: u32,
}

impl Breakpoint {
    /// A `step` breakpoint on the given step.
    pub fn on_step(step_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: Some(step_id.into()),
            kind: BreakpointKind::Step,
            condition: None,
            log_point: None,
            enabled: true,
            hit_count: 0,
        }
    }

    /// A `conditional` breakpoint with an expression.
    pub fn conditional(condition: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: None,
            kind: BreakpointKind::Conditional,
            condition: Some(condition.into()),
            log_point: None,
            enabled: true,
            hit_count: 0,
        }
    }

    /// An `error` breakpoint.
    pub fn on_error() -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: None,
            kind: BreakpointKind::Error,
            condition: None,
            log_point: None,
            enabled: true,
            hit_count: 0,
        }
    }

    /// An `assertion` breakpoint.
    pub fn on_assertion_failure() -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: None,
            kind: BreakpointKind::Assertion,
            condition: None,
            log_point: None,
            enabled: true,
            hit_count: 0,
        }
    }

    /// A log-point on the given step; emits and continues.
    pub fn log_point(step_id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: Some(step_id.into()),
            kind: BreakpointKind::Step,
            condition: None,
            log_point: Some(template.into()),
            enabled: true,
            hit_count: 0,
        }
    }
}

/// Snapshot captured at each pause, appended to session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step_id: String,
    /// Resolved input at the time of the pause, if available.
    pub input: Value,
    /// Flattened variable view.
    pub variables: Value,
    pub captured_at: DateTime<Utc>,
}

/// One debug session attached to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub flow_id: Uuid,
    pub state: DebugState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub breakpoints: Vec<Breakpoint>,
    /// Append-only pause history.
    pub step_history: Vec<StepSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl DebugSession {
    /// Creates an idle session for an execution.
    pub fn new(execution_id: Uuid, flow_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            flow_id,
            state: DebugState::Idle,
            current_step: None,
            breakpoints: Vec::new(),
            step_history: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_points_never_pause() {
        let bp = Breakpoint::log_point("step2", "value is {{ vars.x }}");
        assert!(bp.log_point.is_some());
    }

    #[test]
    fn stopped_is_terminal() {
        assert!(DebugState::Stopped.is_terminal());
        assert!(!DebugState::Paused.is_terminal());
    }
}
