// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh collection runner.
//!
//! Two modes over the same engine: data-driven iterations across a
//! dataset, and load-oriented virtual-user scheduling with ramp curves
//! and streaming percentile metrics.

pub mod collection;
pub mod digest;
pub mod load;

pub use collection::{
    CollectionConfig, CollectionOutcome, CollectionRunner, DataSource, IterationResult,
};
pub use digest::{TDigest, DEFAULT_COMPRESSION};
pub use load::{LoadConfig, LoadRunner};
