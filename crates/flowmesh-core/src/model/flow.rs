// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Persisted flow records.

use crate::definition::FlowDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored flow: identity plus its current definition document.
///
/// At most one active definition exists per `(workspace, flow-id)`;
/// executions keep their own immutable snapshot of the definition used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Human name; non-empty.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub definition: FlowDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    /// Creates a record from a validated definition.
    pub fn new(workspace_id: Uuid, definition: FlowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: definition.name.clone(),
            suite: definition.suite.clone(),
            tags: definition.tags.clone(),
            description: definition.description.clone(),
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}
