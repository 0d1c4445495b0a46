// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh execution engine.
//!
//! The per-flow interpreter, the pluggable action registry, the live event
//! hub, and the debugger controller. This crate is runtime-facing: it
//! depends on the core model/expression crates and the store traits, and
//! is driven by the CLI, the collection runner, and the trigger layer.

pub mod api;
pub mod context;
pub mod debug;
pub mod hub;
pub mod interpreter;
pub mod registry;

pub use api::Runtime;
pub use context::{ExecutionContext, CANCEL_GRACE_MS};
pub use debug::{DebuggerController, STOPPED_SESSION_TTL};
pub use hub::{EventHub, Subscription, LANE_CAPACITY};
pub use interpreter::{FlowInterpreter, InterpreterConfig, DEFAULT_STEP_TIMEOUT_MS};
pub use registry::{ActionHandler, ActionOutput, ActionRegistry, StepContext};
