// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Schedules and git trigger rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schedule lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// A cron-driven trigger for a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub workspace_id: Uuid,
    /// Cron expression evaluated in `timezone`.
    pub cron_expr: String,
    /// IANA timezone name, e.g. `Europe/Sofia`.
    pub timezone: String,
    pub status: ScheduleStatus,
    /// Variable overrides applied to every triggered run.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub environment_overrides: Map<String, Value>,
    /// Free-form notification policy forwarded to consumers.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub notify_policy: Value,
    /// Retries for a failed triggered run.
    pub max_retries: u32,
    /// Delay between run retries, milliseconds.
    pub retry_delay_ms: u64,
    /// When false, a tick is skipped while a prior run is still active.
    pub allow_overlap: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Creates an active schedule with defaults.
    pub fn new(flow_id: Uuid, workspace_id: Uuid, cron_expr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            workspace_id,
            cron_expr: cron_expr.into(),
            timezone: "UTC".to_string(),
            status: ScheduleStatus::Active,
            environment_overrides: Map::new(),
            notify_policy: Value::Null,
            max_retries: 0,
            retry_delay_ms: 60_000,
            allow_overlap: false,
            tags: Vec::new(),
            last_run: None,
            next_run: None,
        }
    }

    /// Sets the schedule timezone.
    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }
}

/// How a matched git rule triggers work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire an existing schedule.
    Schedule,
    /// Start a flow execution directly.
    Direct,
}

/// Maps `(repo, branch, event)` webhooks onto schedules or flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitTriggerRule {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// The integration holding the provider secret.
    pub integration_id: Uuid,
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Branch glob; `*` and `**` conventional semantics.
    pub branch_filter: String,
    /// Event types the rule listens for, e.g. `push`, `pull_request`.
    pub event_types: Vec<String>,
    pub trigger_mode: TriggerMode,
    /// Schedule id when mode is `schedule`, flow id when `direct`.
    pub target_id: Uuid,
    pub enabled: bool,
}
