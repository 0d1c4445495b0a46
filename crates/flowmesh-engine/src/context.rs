// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Per-execution shared state.
//!
//! One `ExecutionContext` exists per live execution and is shared by every
//! subtask the interpreter spawns. Variable scope is owned by the
//! interpreter task (single writer); what is shared here is the
//! cancellation signal and the rollup counters, both safe for concurrent
//! access.

use flowmesh_core::CancelReason;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Grace period granted to in-flight handlers after cancellation.
pub const CANCEL_GRACE_MS: u64 = 5_000;

/// Shared state for one live execution.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    execution_id: Uuid,
    cancellation: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    passed: AtomicU32,
    failed: AtomicU32,
    skipped: AtomicU32,
}

impl ExecutionContext {
    /// Creates the context for an execution.
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                execution_id,
                cancellation: CancellationToken::new(),
                cancel_reason: Mutex::new(None),
                passed: AtomicU32::new(0),
                failed: AtomicU32::new(0),
                skipped: AtomicU32::new(0),
            }),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.inner.execution_id
    }

    /// The execution-wide cancellation token. Step tokens are derived
    /// children of this one.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Cancels the execution. Idempotent and one-way: the first reason
    /// wins and later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut guard = self.inner.cancel_reason.lock();
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.inner.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Derives a child context sharing the execution id.
    ///
    /// Cancelling the parent cancels the child; cancelling the child (used
    /// by `fail_fast` parallel blocks) leaves the parent running.
    pub fn child(&self) -> ExecutionContext {
        Self {
            inner: Arc::new(ContextInner {
                execution_id: self.inner.execution_id,
                cancellation: self.inner.cancellation.child_token(),
                cancel_reason: Mutex::new(None),
                passed: AtomicU32::new(0),
                failed: AtomicU32::new(0),
                skipped: AtomicU32::new(0),
            }),
        }
    }

    /// The recorded cancellation reason, if any.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.inner.cancel_reason.lock()
    }

    pub fn record_passed(&self) {
        self.inner.passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Rollup counters `(passed, failed, skipped)`.
    pub fn counters(&self) -> (u32, u32, u32) {
        (
            self.inner.passed.load(Ordering::Relaxed),
            self.inner.failed.load(Ordering::Relaxed),
            self.inner.skipped.load(Ordering::Relaxed),
        )
    }
}
