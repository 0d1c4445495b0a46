// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Browser action handlers.
//!
//! The browser engine is a process-wide shared resource injected behind
//! [`BrowserDriver`]; production wiring supplies a CDP-backed driver at
//! startup. The recorder driver here backs hermetic tests: it tracks
//! navigation and interactions without a real page.

use async_trait::async_trait;
use dashmap::DashMap;
use flowmesh_core::model::Artifact;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Injected browser automation driver. The `session` key scopes browser
/// state per execution.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, session: &str, url: &str) -> Result<()>;
    async fn click(&self, session: &str, selector: &str) -> Result<()>;
    async fn fill(&self, session: &str, selector: &str, value: &str) -> Result<()>;
    /// Waits for a selector to appear; returns whether it did.
    async fn wait_for(&self, session: &str, selector: &str, timeout: Duration) -> Result<bool>;
    /// Captures the current page as PNG bytes.
    async fn screenshot(&self, session: &str) -> Result<Vec<u8>>;
    /// Current page URL, if any.
    async fn current_url(&self, session: &str) -> Result<Option<String>>;
}

/// Driver that records interactions in memory. Selectors registered via
/// [`RecordingDriver::add_element`] are clickable/fillable; everything
/// else errors like a missing element would.
#[derive(Default)]
pub struct RecordingDriver {
    pages: DashMap<String, String>,
    elements: DashMap<String, ()>,
    interactions: DashMap<String, Vec<String>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a selector as present on every page.
    pub fn add_element(&self, selector: &str) {
        self.elements.insert(selector.to_string(), ());
    }

    /// Interactions recorded for a session, in order.
    pub fn interactions(&self, session: &str) -> Vec<String> {
        self.interactions
            .get(session)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn record(&self, session: &str, interaction: String) {
        self.interactions
            .entry(session.to_string())
            .or_default()
            .push(interaction);
    }

    fn require_element(&self, selector: &str) -> Result<()> {
        if self.elements.contains_key(selector) {
            Ok(())
        } else {
            Err(FlowError::handler(format!("element '{selector}' not found")))
        }
    }
}

#[async_trait]
impl BrowserDriver for RecordingDriver {
    async fn navigate(&self, session: &str, url: &str) -> Result<()> {
        self.pages.insert(session.to_string(), url.to_string());
        self.record(session, format!("navigate {url}"));
        Ok(())
    }

    async fn click(&self, session: &str, selector: &str) -> Result<()> {
        self.require_element(selector)?;
        self.record(session, format!("click {selector}"));
        Ok(())
    }

    async fn fill(&self, session: &str, selector: &str, value: &str) -> Result<()> {
        self.require_element(selector)?;
        self.record(session, format!("fill {selector}={value}"));
        Ok(())
    }

    async fn wait_for(&self, session: &str, selector: &str, _timeout: Duration) -> Result<bool> {
        self.record(session, format!("wait_for {selector}"));
        Ok(self.elements.contains_key(selector))
    }

    async fn screenshot(&self, session: &str) -> Result<Vec<u8>> {
        self.record(session, "screenshot".to_string());
        // Minimal valid PNG header followed by no image data; enough for
        // artifact plumbing tests.
        Ok(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
    }

    async fn current_url(&self, session: &str) -> Result<Option<String>> {
        Ok(self.pages.get(session).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Deserialize)]
struct NavigateConfig {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SelectorConfig {
    selector: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default = "default_wait_timeout_ms")]
    timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

/// One handler instance per `browser_*` action kind, sharing the driver.
pub struct BrowserHandler {
    kind: ActionKind,
    driver: Arc<dyn BrowserDriver>,
}

impl BrowserHandler {
    pub fn new(kind: ActionKind, driver: Arc<dyn BrowserDriver>) -> Self {
        debug_assert!(matches!(
            kind,
            ActionKind::BrowserNavigate
                | ActionKind::BrowserClick
                | ActionKind::BrowserFill
                | ActionKind::BrowserWaitFor
                | ActionKind::BrowserScreenshot
        ));
        Self { kind, driver }
    }
}

#[async_trait]
impl ActionHandler for BrowserHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let session = ctx.execution.execution_id().to_string();
        match self.kind {
            ActionKind::BrowserNavigate => {
                let cfg: NavigateConfig = serde_json::from_value(config)
                    .map_err(|e| FlowError::InvalidDefinition(format!("browser config: {e}")))?;
                self.driver.navigate(&session, &cfg.url).await?;
                Ok(ActionOutput::value(json!({"url": cfg.url})))
            }
            ActionKind::BrowserClick => {
                let cfg: SelectorConfig = serde_json::from_value(config)
                    .map_err(|e| FlowError::InvalidDefinition(format!("browser config: {e}")))?;
                self.driver.click(&session, &cfg.selector).await?;
                Ok(ActionOutput::value(json!({"clicked": cfg.selector})))
            }
            ActionKind::BrowserFill => {
                let cfg: SelectorConfig = serde_json::from_value(config)
                    .map_err(|e| FlowError::InvalidDefinition(format!("browser config: {e}")))?;
                let value = cfg.value.unwrap_or_default();
                self.driver.fill(&session, &cfg.selector, &value).await?;
                Ok(ActionOutput::value(json!({"filled": cfg.selector})))
            }
            ActionKind::BrowserWaitFor => {
                let cfg: SelectorConfig = serde_json::from_value(config)
                    .map_err(|e| FlowError::InvalidDefinition(format!("browser config: {e}")))?;
                let found = self
                    .driver
                    .wait_for(&session, &cfg.selector, Duration::from_millis(cfg.timeout_ms))
                    .await?;
                if !found {
                    return Err(FlowError::Timeout {
                        elapsed_ms: cfg.timeout_ms,
                        budget_ms: cfg.timeout_ms,
                    });
                }
                Ok(ActionOutput::value(json!({"found": cfg.selector})))
            }
            ActionKind::BrowserScreenshot => {
                let png = self.driver.screenshot(&session).await?;
                let url = self.driver.current_url(&session).await?;
                let artifact = Artifact::inline("screenshot.png", "image/png", &png);
                Ok(ActionOutput {
                    output: json!({"screenshot": true, "url": url, "size_bytes": png.len()}),
                    artifacts: vec![artifact],
                })
            }
            _ => Err(FlowError::handler("not a browser action")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_engine::ExecutionContext;
    use uuid::Uuid;

    fn ctx() -> StepContext {
        StepContext {
            execution: ExecutionContext::new(Uuid::new_v4()),
            step_id: "b".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn navigate_fill_click_sequence_is_recorded() {
        let driver = Arc::new(RecordingDriver::new());
        driver.add_element("#user");
        driver.add_element("#submit");

        let ctx = ctx();
        let session = ctx.execution.execution_id().to_string();

        BrowserHandler::new(ActionKind::BrowserNavigate, driver.clone())
            .execute(&ctx, json!({"url": "https://app.test/login"}), &Scope::new())
            .await
            .unwrap();
        BrowserHandler::new(ActionKind::BrowserFill, driver.clone())
            .execute(&ctx, json!({"selector": "#user", "value": "dana"}), &Scope::new())
            .await
            .unwrap();
        BrowserHandler::new(ActionKind::BrowserClick, driver.clone())
            .execute(&ctx, json!({"selector": "#submit"}), &Scope::new())
            .await
            .unwrap();

        let interactions = driver.interactions(&session);
        assert_eq!(
            interactions,
            vec![
                "navigate https://app.test/login",
                "fill #user=dana",
                "click #submit",
            ]
        );
    }

    #[tokio::test]
    async fn clicking_a_missing_element_fails() {
        let driver = Arc::new(RecordingDriver::new());
        let err = BrowserHandler::new(ActionKind::BrowserClick, driver)
            .execute(&ctx(), json!({"selector": "#ghost"}), &Scope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Handler { .. }));
    }

    #[tokio::test]
    async fn screenshot_produces_an_artifact() {
        let driver = Arc::new(RecordingDriver::new());
        let out = BrowserHandler::new(ActionKind::BrowserScreenshot, driver)
            .execute(&ctx(), json!({}), &Scope::new())
            .await
            .unwrap();
        assert_eq!(out.artifacts.len(), 1);
        assert_eq!(out.artifacts[0].content_type, "image/png");
    }
}
