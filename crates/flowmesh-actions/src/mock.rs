// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Mock endpoint registry.
//!
//! `mock_configure` steps register canned responses; the HTTP handler
//! consults the registry for `mock://` URLs so flows can run hermetically.

use async_trait::async_trait;
use dashmap::DashMap;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// A canned response for one mocked route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
    /// Injected latency before the response is returned.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_status() -> u16 {
    200
}

/// Route table keyed by `(method, url)`.
#[derive(Default)]
pub struct MockRegistry {
    routes: DashMap<(String, String), MockResponse>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a mocked route.
    pub fn configure(&self, method: &str, url: &str, response: MockResponse) {
        self.routes
            .insert((method.to_ascii_uppercase(), url.to_string()), response);
    }

    /// Looks up a mocked route.
    pub fn lookup(&self, method: &str, url: &str) -> Option<MockResponse> {
        self.routes
            .get(&(method.to_ascii_uppercase(), url.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Removes every registered route.
    pub fn clear(&self) {
        self.routes.clear();
    }
}

/// `mock_configure` config.
#[derive(Debug, Deserialize)]
struct MockConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    delay_ms: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Handler for `mock_configure`.
pub struct MockConfigureHandler {
    registry: Arc<MockRegistry>,
}

impl MockConfigureHandler {
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ActionHandler for MockConfigureHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::MockConfigure
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: MockConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("mock_configure config: {e}")))?;
        self.registry.configure(
            &cfg.method,
            &cfg.url,
            MockResponse {
                status: cfg.status,
                headers: cfg.headers,
                body: cfg.body,
                delay_ms: cfg.delay_ms,
            },
        );
        Ok(ActionOutput::value(json!({
            "configured": true,
            "method": cfg.method,
            "url": cfg.url,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_and_lookup_is_method_insensitive() {
        let registry = MockRegistry::new();
        registry.configure(
            "get",
            "mock://api/ping",
            MockResponse { status: 200, headers: Map::new(), body: json!({"ok": true}), delay_ms: 0 },
        );
        let hit = registry.lookup("GET", "mock://api/ping").unwrap();
        assert_eq!(hit.status, 200);
        assert!(registry.lookup("POST", "mock://api/ping").is_none());
    }
}
