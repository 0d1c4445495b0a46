// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh core: value model, expression language, flow definition schema,
//! assertion evaluator, and the persisted entity models shared by the
//! engine, runner, trigger, and state crates.

pub mod assertion;
pub mod definition;
pub mod error;
pub mod expr;
pub mod model;
pub mod scope;
pub mod value;

pub use assertion::{Assertion, AssertionContext, AssertionKind, AssertionResult, PathMatcher};
pub use definition::{
    ActionKind, ConditionConfig, FlowDefinition, ForEachConfig, ParallelConfig, RetryPolicy, Step,
    SubFlowConfig, WaitConfig,
};
pub use error::{CancelReason, ErrorDetail, ErrorKind, FlowError, Result};
pub use expr::Functions;
pub use scope::Scope;
