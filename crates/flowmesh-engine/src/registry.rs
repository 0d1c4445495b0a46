// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Action handler contract and registry.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use dashmap::DashMap;
use flowmesh_core::model::Artifact;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-step view handed to handlers.
pub struct StepContext {
    /// The owning execution's shared state, including cancellation.
    pub execution: ExecutionContext,
    /// The step being executed.
    pub step_id: String,
    /// Effective timeout (step override, else flow timeout, else 30 s).
    pub timeout: Duration,
}

/// What a handler returns on success.
#[derive(Debug, Default)]
pub struct ActionOutput {
    /// Captured output, asserted against and bound via `save`.
    pub output: Value,
    /// Artifacts captured during execution.
    pub artifacts: Vec<Artifact>,
}

impl ActionOutput {
    /// Output with no artifacts.
    pub fn value(output: Value) -> Self {
        Self { output, artifacts: Vec::new() }
    }
}

/// One protocol or primitive implementation.
///
/// Handlers receive a fully-resolved config (no template strings), must
/// observe the execution's cancellation token, and must not keep mutable
/// state that is unsafe under concurrent calls.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The action kind this handler serves.
    fn kind(&self) -> ActionKind;

    /// Executes the action.
    async fn execute(&self, ctx: &StepContext, config: Value, scope: &Scope)
        -> Result<ActionOutput>;
}

/// Registry mapping action kinds to handlers.
///
/// Registration happens at process start; execution only reads.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: DashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for the same kind.
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Looks up the handler for an action kind.
    pub fn get(&self, kind: ActionKind) -> Result<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FlowError::handler(format!("no handler registered for '{kind}'")))
    }

    /// Registered kinds, for diagnostics.
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.handlers.iter().map(|entry| *entry.key()).collect()
    }
}
