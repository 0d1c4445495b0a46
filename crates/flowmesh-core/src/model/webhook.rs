// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Webhook delivery audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one inbound webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Signature verified; matching rules (possibly zero) were processed.
    Success,
    /// Signature mismatch; nothing was triggered.
    Rejected,
    /// Verified but processing failed.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Rejected => write!(f, "rejected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable audit record for one inbound webhook call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    /// Provider name, e.g. `github`.
    pub provider: String,
    /// Provider-supplied delivery id, when one was sent.
    ///
    /// Deliveries carrying an id are deduplicated on
    /// `(provider, delivery_id)`; without one the contract is
    /// at-least-once and a replay may re-trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Raw request body as received.
    pub payload: String,
    /// Signature header as received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub status: DeliveryStatus,
    /// Human-readable outcome note (`ignored`, rejection reason, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Executions started by this delivery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_runs: Vec<Uuid>,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Creates a received-but-unprocessed record.
    pub fn received(provider: impl Into<String>, event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            delivery_id: None,
            event_type: event_type.into(),
            repo: None,
            branch: None,
            commit_sha: None,
            payload: payload.into(),
            signature: None,
            status: DeliveryStatus::Failed,
            message: None,
            triggered_runs: Vec::new(),
            received_at: Utc::now(),
            processed_at: None,
        }
    }
}
