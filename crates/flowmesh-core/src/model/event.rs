// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Live event types published over the hub.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event discriminator used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "debug.paused")]
    DebugPaused,
    #[serde(rename = "debug.resumed")]
    DebugResumed,
    #[serde(rename = "debug.stopped")]
    DebugStopped,
    #[serde(rename = "debug.breakpoint_hit")]
    DebugBreakpointHit,
    #[serde(rename = "debug.log_point")]
    DebugLogPoint,
    #[serde(rename = "event_dropped")]
    EventDropped,
}

impl EventType {
    /// Wire tag for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionCancelled => "execution.cancelled",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepSkipped => "step.skipped",
            Self::Log => "log",
            Self::DebugPaused => "debug.paused",
            Self::DebugResumed => "debug.resumed",
            Self::DebugStopped => "debug.stopped",
            Self::DebugBreakpointHit => "debug.breakpoint_hit",
            Self::DebugLogPoint => "debug.log_point",
            Self::EventDropped => "event_dropped",
        }
    }

    /// Debug events must never be dropped under backpressure.
    pub fn is_debug(&self) -> bool {
        matches!(
            self,
            Self::DebugPaused
                | Self::DebugResumed
                | Self::DebugStopped
                | Self::DebugBreakpointHit
                | Self::DebugLogPoint
        )
    }
}

/// One event on the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: Uuid,
    /// UTC milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub payload: Value,
}

impl RunEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: EventType, execution_id: Uuid, payload: Value) -> Self {
        Self {
            event_type,
            execution_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_matches_channel_contract() {
        let event = RunEvent::new(EventType::StepCompleted, Uuid::nil(), json!({"step_id": "a"}));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "step.completed");
        assert_eq!(wire["payload"]["step_id"], "a");
        assert!(wire["timestamp_ms"].is_i64());
    }

    #[test]
    fn debug_events_are_flagged() {
        assert!(EventType::DebugPaused.is_debug());
        assert!(!EventType::StepCompleted.is_debug());
    }
}
