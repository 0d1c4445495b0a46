// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Load-test result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Load-test lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTestStatus {
    /// Result record allocated, run not yet started.
    Starting,
    Running,
    Finished,
    Cancelled,
    Failed,
}

impl LoadTestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }
}

/// Dense aggregate over an entire load test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Requests per second across all terminal HTTP-like actions.
    pub throughput_rps: f64,
    pub latency_min_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

/// One per-second timeline bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineBucket {
    /// Bucket timestamp; strictly monotone non-decreasing across a timeline.
    pub t: DateTime<Utc>,
    pub rps: f64,
    pub active_vus: u32,
    /// Iterations completed during this bucket.
    pub iterations: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    /// Errors divided by requests within the bucket, 0 when idle.
    pub error_rate: f64,
}

/// Result of one load-test run.
///
/// The id is allocated and the record stored with `status=starting`
/// before the runner begins, so external queries see the result
/// immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestResult {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub status: LoadTestStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: LoadMetrics,
    pub timeline: Vec<TimelineBucket>,
    /// Virtual users that failed to stop within the grace period.
    pub orphaned_vus: u32,
}

impl LoadTestResult {
    /// Allocates a starting record.
    pub fn starting(flow_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            status: LoadTestStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
            metrics: LoadMetrics::default(),
            timeline: Vec::new(),
            orphaned_vus: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_record_has_empty_metrics() {
        let result = LoadTestResult::starting(Uuid::new_v4());
        assert_eq!(result.status, LoadTestStatus::Starting);
        assert_eq!(result.metrics.total_requests, 0);
        assert!(result.timeline.is_empty());
    }
}
