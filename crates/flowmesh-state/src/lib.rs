// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh persistence surface.
//!
//! The runtime depends only on the narrow store traits here; backing
//! implementations are swapped at process start. In-memory stores are
//! provided for tests and single-process deployments.

mod memory;
mod stores;

pub use memory::{
    InMemoryArtifactStore, InMemoryDeliveryStore, InMemoryExecutionStore, InMemoryFlowStore,
    InMemoryLoadTestStore, InMemoryScheduleStore, InMemoryStepStore, InMemoryTriggerRuleStore,
};
pub use stores::{
    ArtifactStore, DeliveryStore, ExecutionFilter, ExecutionStore, FlowStore, LoadTestStore,
    ScheduleStore, StepStore, TriggerRuleStore,
};
