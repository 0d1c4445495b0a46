// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Webhook dispatcher.
//!
//! Verifies HMAC-SHA256 signatures over the raw body (hex, `sha256=`
//! prefix, constant-time compare), parses `push`/`pull_request` events,
//! fans matched rules out into schedule triggers or direct executions,
//! and records an immutable delivery audit row for every inbound call.
//!
//! Deliveries carrying a provider delivery id deduplicate on
//! `(provider, delivery_id)`; without one the contract is at-least-once
//! and a replayed body may re-trigger.

use crate::launcher::RunLauncher;
use crate::scheduler::CronScheduler;
use chrono::Utc;
use flowmesh_core::model::{DeliveryStatus, GitTriggerRule, TriggerMode, TriggerSource, WebhookDelivery};
use flowmesh_core::Result;
use flowmesh_state::{DeliveryStore, TriggerRuleStore};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Provider secrets, keyed by provider name.
///
/// The integrations vault is an external collaborator; this is the narrow
/// surface the dispatcher needs from it.
pub trait SecretProvider: Send + Sync {
    fn secret_for(&self, provider: &str) -> Option<String>;
}

/// Static secret table for single-process deployments and tests.
#[derive(Default)]
pub struct StaticSecrets {
    secrets: BTreeMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(provider.into(), secret.into());
        self
    }
}

impl SecretProvider for StaticSecrets {
    fn secret_for(&self, provider: &str) -> Option<String> {
        self.secrets.get(provider).cloned()
    }
}

/// Parsed git event fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitEvent {
    pub event_type: String,
    pub repo: String,
    pub branch: String,
    pub commit_sha: Option<String>,
}

/// Outcome returned to the HTTP layer.
#[derive(Debug)]
pub struct IngestResponse {
    /// Suggested HTTP status: 200, 401, or 500.
    pub status: u16,
    pub message: String,
    pub delivery_id: Uuid,
    pub triggered_runs: Vec<Uuid>,
}

/// The dispatcher.
pub struct WebhookDispatcher {
    secrets: Arc<dyn SecretProvider>,
    rules: Arc<dyn TriggerRuleStore>,
    deliveries: Arc<dyn DeliveryStore>,
    scheduler: CronScheduler,
    launcher: Arc<dyn RunLauncher>,
}

impl WebhookDispatcher {
    pub fn new(
        secrets: Arc<dyn SecretProvider>,
        rules: Arc<dyn TriggerRuleStore>,
        deliveries: Arc<dyn DeliveryStore>,
        scheduler: CronScheduler,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        Self { secrets, rules, deliveries, scheduler, launcher }
    }

    /// `webhook.ingest`: the full path from raw POST to triggered runs.
    pub async fn ingest(
        &self,
        provider: &str,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
    ) -> Result<IngestResponse> {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let event_type = header("x-github-event").unwrap_or_else(|| "unknown".to_string());
        let provider_delivery_id = header("x-github-delivery");
        let signature = header("x-hub-signature-256");

        let mut delivery = WebhookDelivery::received(
            provider,
            event_type.clone(),
            String::from_utf8_lossy(raw_body).to_string(),
        );
        delivery.delivery_id = provider_delivery_id.clone();
        delivery.signature = signature.clone();

        // Signature verification, constant-time. Nothing — the dedup
        // lookup included — happens for a body that does not verify.
        let secret = self.secrets.secret_for(provider);
        let verified = match (&secret, &signature) {
            (Some(secret), Some(signature)) => verify_signature(secret, signature, raw_body),
            _ => false,
        };
        if !verified {
            warn!(provider = provider, "webhook signature rejected");
            delivery.status = DeliveryStatus::Rejected;
            delivery.message = Some("signature mismatch".to_string());
            delivery.processed_at = Some(Utc::now());
            let delivery_id = delivery.id;
            self.deliveries.insert(delivery).await?;
            return Ok(IngestResponse {
                status: 401,
                message: "signature mismatch".to_string(),
                delivery_id,
                triggered_runs: Vec::new(),
            });
        }

        // Dedupe on (provider, delivery_id) when the provider supplies one.
        if let Some(id) = &provider_delivery_id {
            if let Some(previous) = self.deliveries.find_by_delivery_id(provider, id).await? {
                info!(provider = provider, delivery_id = %id, "duplicate delivery ignored");
                return Ok(IngestResponse {
                    status: 200,
                    message: "duplicate delivery".to_string(),
                    delivery_id: previous.id,
                    triggered_runs: Vec::new(),
                });
            }
        }

        // Event parsing; unsupported events are accepted and ignored.
        let event = match parse_event(&event_type, raw_body) {
            Some(event) => event,
            None => {
                delivery.status = DeliveryStatus::Success;
                delivery.message = Some("ignored".to_string());
                delivery.processed_at = Some(Utc::now());
                let delivery_id = delivery.id;
                self.deliveries.insert(delivery).await?;
                return Ok(IngestResponse {
                    status: 200,
                    message: format!("event '{event_type}' ignored"),
                    delivery_id,
                    triggered_runs: Vec::new(),
                });
            }
        };
        delivery.repo = Some(event.repo.clone());
        delivery.branch = Some(event.branch.clone());
        delivery.commit_sha = event.commit_sha.clone();

        // Rule fan-out.
        let mut triggered = Vec::new();
        let mut failure: Option<String> = None;
        for rule in self.rules.list_enabled().await? {
            if !rule_matches(&rule, &event) {
                continue;
            }
            let result = match rule.trigger_mode {
                TriggerMode::Schedule => self.scheduler.trigger_now(rule.target_id).await,
                TriggerMode::Direct => {
                    self.launcher
                        .launch(
                            rule.workspace_id,
                            rule.target_id,
                            serde_json::Map::new(),
                            TriggerSource::Webhook(delivery.id),
                        )
                        .await
                }
            };
            match result {
                Ok(execution_id) => triggered.push(execution_id),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "rule trigger failed");
                    failure = Some(e.to_string());
                }
            }
        }

        delivery.triggered_runs = triggered.clone();
        delivery.processed_at = Some(Utc::now());
        if let Some(message) = failure {
            delivery.status = DeliveryStatus::Failed;
            delivery.message = Some(message);
        } else {
            delivery.status = DeliveryStatus::Success;
        }
        let delivery_id = delivery.id;
        let status = delivery.status;
        self.deliveries.insert(delivery).await?;

        info!(
            provider = provider,
            delivery_id = %delivery_id,
            triggered = triggered.len(),
            "webhook processed"
        );
        Ok(IngestResponse {
            status: if status == DeliveryStatus::Failed { 500 } else { 200 },
            message: format!("{} run(s) triggered", triggered.len()),
            delivery_id,
            triggered_runs: triggered,
        })
    }
}

/// Verifies `sha256=<hex>` over the raw body. The comparison inside
/// `verify_slice` is constant-time.
pub fn verify_signature(secret: &str, signature_header: &str, raw_body: &[u8]) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Computes the signature header value for a body; used by tests and the
/// outbound replay tooling.
pub fn sign(secret: &str, raw_body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(raw_body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Extracts `(repo, branch, commit)` from supported event payloads.
pub fn parse_event(event_type: &str, raw_body: &[u8]) -> Option<GitEvent> {
    let payload: Value = serde_json::from_slice(raw_body).ok()?;
    match event_type {
        "push" => {
            let repo = payload["repository"]["full_name"].as_str()?.to_string();
            let git_ref = payload["ref"].as_str()?;
            let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref).to_string();
            let commit_sha = payload["after"].as_str().map(str::to_string);
            Some(GitEvent { event_type: "push".to_string(), repo, branch, commit_sha })
        }
        "pull_request" => {
            let repo = payload["repository"]["full_name"].as_str()?.to_string();
            let branch = payload["pull_request"]["head"]["ref"].as_str()?.to_string();
            let commit_sha = payload["pull_request"]["head"]["sha"].as_str().map(str::to_string);
            Some(GitEvent { event_type: "pull_request".to_string(), repo, branch, commit_sha })
        }
        _ => None,
    }
}

/// Rule matching over `(repo, branch glob, event type)`.
///
/// Conventional glob semantics: `*` stays within one `/`-separated
/// segment, `**` crosses segments.
pub fn rule_matches(rule: &GitTriggerRule, event: &GitEvent) -> bool {
    if !rule.enabled || rule.repo != event.repo {
        return false;
    }
    if !rule.event_types.iter().any(|t| t == &event.event_type) {
        return false;
    }
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(&rule.branch_filter) {
        Ok(pattern) => pattern.matches_with(&event.branch, options),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_core::model::ExecutionStatus;
    use flowmesh_state::{InMemoryDeliveryStore, InMemoryScheduleStore, InMemoryTriggerRuleStore};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<Uuid>>,
    }

    #[async_trait::async_trait]
    impl RunLauncher for FakeLauncher {
        async fn launch(
            &self,
            _workspace_id: Uuid,
            _flow_id: Uuid,
            _variables: serde_json::Map<String, Value>,
            _trigger: TriggerSource,
        ) -> Result<Uuid> {
            let id = Uuid::new_v4();
            self.launched.lock().push(id);
            Ok(id)
        }

        async fn status(&self, _execution_id: Uuid) -> Result<Option<ExecutionStatus>> {
            Ok(Some(ExecutionStatus::Completed))
        }
    }

    fn push_body(repo: &str, branch: &str) -> Vec<u8> {
        json!({
            "repository": {"full_name": repo},
            "ref": format!("refs/heads/{branch}"),
            "after": "abc123",
        })
        .to_string()
        .into_bytes()
    }

    fn dispatcher(
        secret: &str,
        rules: Arc<InMemoryTriggerRuleStore>,
        deliveries: Arc<InMemoryDeliveryStore>,
        launcher: Arc<FakeLauncher>,
    ) -> WebhookDispatcher {
        let scheduler = CronScheduler::new(Arc::new(InMemoryScheduleStore::new()), launcher.clone());
        WebhookDispatcher::new(
            Arc::new(StaticSecrets::new().with_secret("github", secret)),
            rules,
            deliveries,
            scheduler,
            launcher,
        )
    }

    fn headers(event: &str, signature: &str, delivery: Option<&str>) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("X-GitHub-Event".to_string(), event.to_string());
        h.insert("X-Hub-Signature-256".to_string(), signature.to_string());
        if let Some(d) = delivery {
            h.insert("X-GitHub-Delivery".to_string(), d.to_string());
        }
        h
    }

    fn rule(repo: &str, branch_filter: &str) -> GitTriggerRule {
        GitTriggerRule {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            repo: repo.to_string(),
            branch_filter: branch_filter.to_string(),
            event_types: vec!["push".to_string()],
            trigger_mode: TriggerMode::Direct,
            target_id: Uuid::new_v4(),
            enabled: true,
        }
    }

    #[test]
    fn signature_round_trip() {
        let body = b"{\"x\":1}";
        let signature = sign("s3cret", body);
        assert!(verify_signature("s3cret", &signature, body));
        assert!(!verify_signature("s3cret", &signature, b"{\"x\":2}"));
        assert!(!verify_signature("wrong", &signature, body));
        assert!(!verify_signature("s3cret", "sha256=zz", body));
    }

    #[test]
    fn branch_globs() {
        let event = GitEvent {
            event_type: "push".to_string(),
            repo: "acme/app".to_string(),
            branch: "feature/login".to_string(),
            commit_sha: None,
        };
        assert!(rule_matches(&rule("acme/app", "feature/*"), &event));
        assert!(rule_matches(&rule("acme/app", "**"), &event));
        assert!(!rule_matches(&rule("acme/app", "main"), &event));
        assert!(!rule_matches(&rule("acme/other", "**"), &event));
    }

    #[test]
    fn push_ref_maps_to_branch() {
        let event = parse_event("push", &push_body("acme/app", "main")).unwrap();
        assert_eq!(event.branch, "main");
        assert_eq!(event.commit_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_with_audit() {
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher(
            "s3cret",
            Arc::new(InMemoryTriggerRuleStore::new()),
            deliveries.clone(),
            launcher.clone(),
        );

        let body = push_body("acme/app", "main");
        let response = d
            .ingest("github", &headers("push", "sha256=deadbeef", None), &body)
            .await
            .unwrap();

        assert_eq!(response.status, 401);
        assert!(response.triggered_runs.is_empty());
        assert!(launcher.launched.lock().is_empty());

        let audit = deliveries.list().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, DeliveryStatus::Rejected);
    }

    #[tokio::test]
    async fn matching_rule_triggers_a_run() {
        let rules = Arc::new(InMemoryTriggerRuleStore::new());
        rules.put(rule("acme/app", "main")).await.unwrap();
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher("s3cret", rules, deliveries.clone(), launcher.clone());

        let body = push_body("acme/app", "main");
        let signature = sign("s3cret", &body);
        let response = d
            .ingest("github", &headers("push", &signature, Some("d-1")), &body)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.triggered_runs.len(), 1);
        let audit = deliveries.list().await.unwrap();
        assert_eq!(audit[0].status, DeliveryStatus::Success);
        assert_eq!(audit[0].triggered_runs.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_id_does_not_retrigger() {
        let rules = Arc::new(InMemoryTriggerRuleStore::new());
        rules.put(rule("acme/app", "main")).await.unwrap();
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher("s3cret", rules, deliveries, launcher.clone());

        let body = push_body("acme/app", "main");
        let signature = sign("s3cret", &body);
        let h = headers("push", &signature, Some("d-1"));
        d.ingest("github", &h, &body).await.unwrap();
        let replay = d.ingest("github", &h, &body).await.unwrap();

        assert_eq!(replay.status, 200);
        assert!(replay.triggered_runs.is_empty());
        assert_eq!(launcher.launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn known_delivery_id_with_bad_signature_is_still_rejected() {
        let rules = Arc::new(InMemoryTriggerRuleStore::new());
        rules.put(rule("acme/app", "main")).await.unwrap();
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher("s3cret", rules, deliveries.clone(), launcher);

        // A valid delivery establishes the known id.
        let body = push_body("acme/app", "main");
        let signature = sign("s3cret", &body);
        d.ingest("github", &headers("push", &signature, Some("d-1")), &body)
            .await
            .unwrap();

        // A forged replay of the same id must fail verification, not be
        // short-circuited as a duplicate.
        let forged = d
            .ingest("github", &headers("push", "sha256=deadbeef", Some("d-1")), &body)
            .await
            .unwrap();
        assert_eq!(forged.status, 401);
        assert_eq!(forged.message, "signature mismatch");

        let audit = deliveries.list().await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].status, DeliveryStatus::Rejected);
    }

    #[tokio::test]
    async fn unsupported_event_is_accepted_and_ignored() {
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let launcher = Arc::new(FakeLauncher::default());
        let d = dispatcher(
            "s3cret",
            Arc::new(InMemoryTriggerRuleStore::new()),
            deliveries.clone(),
            launcher,
        );

        let body = b"{\"zen\":\"ship it\"}".to_vec();
        let signature = sign("s3cret", &body);
        let response = d
            .ingest("github", &headers("ping", &signature, None), &body)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.message.contains("ignored"));
    }
}
