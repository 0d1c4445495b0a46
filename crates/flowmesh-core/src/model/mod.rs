// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Persisted entity models shared across the runtime.

mod artifact;
mod debug;
mod event;
mod execution;
mod flow;
mod loadtest;
mod schedule;
mod webhook;

pub use artifact::{Artifact, INLINE_LIMIT_BYTES};
pub use debug::{Breakpoint, BreakpointKind, DebugSession, DebugState, StepSnapshot};
pub use event::{EventType, RunEvent};
pub use execution::{
    Execution, ExecutionStatus, StepExecution, StepState, TriggerSource,
};
pub use flow::FlowRecord;
pub use loadtest::{LoadMetrics, LoadTestResult, LoadTestStatus, TimelineBucket};
pub use schedule::{GitTriggerRule, Schedule, ScheduleStatus, TriggerMode};
pub use webhook::{DeliveryStatus, WebhookDelivery};

/// Default retention for executions, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
