// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh trigger layer: cron scheduling and webhook ingestion.

pub mod launcher;
pub mod scheduler;
pub mod webhook;

pub use launcher::RunLauncher;
pub use scheduler::{next_fire, CronScheduler};
pub use webhook::{
    parse_event, rule_matches, sign, verify_signature, GitEvent, IngestResponse, SecretProvider,
    StaticSecrets, WebhookDispatcher,
};
