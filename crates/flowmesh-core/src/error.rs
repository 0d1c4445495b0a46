// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the FlowMesh runtime.
//!
//! The closed set of error kinds the core produces or propagates, together
//! with their default retry classification.

use serde::{Deserialize, Serialize};

/// Reason an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The cancel API was invoked by a user.
    UserCancelled,
    /// The execution exceeded its time budget.
    Timeout,
    /// A debugger session issued a stop.
    DebuggerStop,
    /// A parent construct (parallel block, collection run) failed.
    ParentFailed,
    /// The worker process is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserCancelled => write!(f, "user_cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::DebuggerStop => write!(f, "debugger_stop"),
            Self::ParentFailed => write!(f, "parent_failed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Closed classification of runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema validation failed.
    InvalidDefinition,
    /// Expression resolution referenced an unknown identifier.
    UndefinedReference,
    /// Dynamic type mismatch during resolution or comparison.
    TypeError,
    /// A step or execution exceeded its time budget.
    Timeout,
    /// Propagated cancellation.
    Cancelled,
    /// A handler returned a protocol-level error.
    HandlerError,
    /// One or more assertions did not hold.
    AssertionFailed,
    /// Sub-flow recursion limit exceeded.
    Cycle,
    /// Worker or connection limits reached.
    Capacity,
    /// A repository write failed.
    PersistenceError,
    /// A conflicting debug session already exists.
    Conflict,
    /// The referenced entity does not exist.
    NotFound,
}

impl ErrorKind {
    /// Stable snake_case name used in persisted records and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidDefinition => "invalid_definition",
            Self::UndefinedReference => "undefined_reference",
            Self::TypeError => "type_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::HandlerError => "handler_error",
            Self::AssertionFailed => "assertion_failed",
            Self::Cycle => "cycle",
            Self::Capacity => "capacity",
            Self::PersistenceError => "persistence_error",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime error produced by the core components.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// Flow definition failed schema validation.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// An expression referenced an identifier absent from every scope frame.
    #[error("undefined reference: {0}")]
    UndefinedReference(String),

    /// A value had the wrong dynamic type for the requested operation.
    #[error("type error: {0}")]
    TypeError(String),

    /// Step or execution exceeded its budget.
    #[error("timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    Timeout {
        /// Wall time observed when the timeout fired.
        elapsed_ms: u64,
        /// The effective budget that was exceeded.
        budget_ms: u64,
    },

    /// Execution was cancelled.
    #[error("cancelled ({0})")]
    Cancelled(CancelReason),

    /// Protocol-level failure reported by an action handler.
    #[error("handler error: {message}")]
    Handler {
        /// Human-readable description from the handler.
        message: String,
        /// Whether the handler considers the failure transient.
        retryable: bool,
    },

    /// One or more assertions failed on a step.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// Sub-flow recursion exceeded the configured depth cap.
    #[error("sub-flow recursion limit exceeded (depth {0})")]
    Cycle(usize),

    /// Worker pool or per-protocol connection limits reached.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// A repository operation failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A debug session already exists for the execution.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl FlowError {
    /// Convenience constructor for handler errors that should not retry.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler { message: message.into(), retryable: false }
    }

    /// Convenience constructor for transient handler errors.
    pub fn handler_retryable(message: impl Into<String>) -> Self {
        Self::Handler { message: message.into(), retryable: true }
    }

    /// The closed-set kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDefinition(_) => ErrorKind::InvalidDefinition,
            Self::UndefinedReference(_) => ErrorKind::UndefinedReference,
            Self::TypeError(_) => ErrorKind::TypeError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Handler { .. } => ErrorKind::HandlerError,
            Self::AssertionFailed(_) => ErrorKind::AssertionFailed,
            Self::Cycle(_) => ErrorKind::Cycle,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Persistence(_) => ErrorKind::PersistenceError,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Default retry classification per kind.
    ///
    /// `handler_error` carries its own per-handler flag; `capacity` and
    /// `persistence_error` are retryable with a bounded attempt count
    /// enforced by the caller.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Capacity(_) | Self::Persistence(_) => true,
            Self::Handler { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// True when the error is a propagated cancellation.
    ///
    /// Cancellation supersedes every other error: a step cancelled mid-flight
    /// records `cancelled`, never a derivative of its handler's error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Serializable error payload attached to step and execution records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Closed-set error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&FlowError> for ErrorDetail {
    fn from(err: &FlowError) -> Self {
        Self { kind: err.kind(), message: err.to_string(), details: None }
    }
}

/// Shorthand result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable_by_default() {
        let err = FlowError::Timeout { elapsed_ms: 31_000, budget_ms: 30_000 };
        assert!(err.retryable());
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn handler_error_carries_its_own_retry_flag() {
        assert!(FlowError::handler_retryable("connection reset").retryable());
        assert!(!FlowError::handler("404 not found").retryable());
    }

    #[test]
    fn cancellation_supersedes() {
        let err = FlowError::Cancelled(CancelReason::UserCancelled);
        assert!(err.is_cancelled());
        assert!(!err.retryable());
    }

    #[test]
    fn error_detail_round_trips() {
        let err = FlowError::UndefinedReference("steps.login.token".into());
        let detail = ErrorDetail::from(&err);
        assert_eq!(detail.kind, ErrorKind::UndefinedReference);
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "undefined_reference");
    }
}
