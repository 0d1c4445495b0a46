// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! HTTP action handler.
//!
//! Output shape: `{ status, headers, body, body_raw, size_bytes }`. The
//! parsed `body` keeps native JSON types so downstream extractions stay
//! typed; `body_raw` carries the text for substring/regex assertions.
//! Bodies above the inline limit are stored as artifacts and referenced.

use crate::mock::MockRegistry;
use async_trait::async_trait;
use flowmesh_core::model::{Artifact, INLINE_LIMIT_BYTES};
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use flowmesh_state::ArtifactStore;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// `http_request` config.
#[derive(Debug, Deserialize)]
struct HttpConfig {
    method: String,
    url: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    query: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    /// Per-request timeout override in milliseconds.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Handler for `http_request`.
pub struct HttpHandler {
    client: reqwest::Client,
    mocks: Arc<MockRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    limiter: Arc<Semaphore>,
}

impl HttpHandler {
    pub fn new(
        client: reqwest::Client,
        mocks: Arc<MockRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self { client, mocks, artifacts, limiter }
    }

    async fn execute_mock(&self, method: &str, url: &str) -> Result<ActionOutput> {
        let Some(mock) = self.mocks.lookup(method, url) else {
            return Err(FlowError::handler(format!(
                "no mock configured for {method} {url}"
            )));
        };
        if mock.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
        }
        let body_raw = mock.body.to_string();
        Ok(ActionOutput::value(json!({
            "status": mock.status,
            "headers": mock.headers,
            "body": mock.body,
            "body_raw": body_raw,
            "size_bytes": body_raw.len(),
        })))
    }
}

#[async_trait]
impl ActionHandler for HttpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::HttpRequest
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: HttpConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("http_request config: {e}")))?;

        if cfg.url.starts_with("mock://") {
            return self.execute_mock(&cfg.method, &cfg.url).await;
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FlowError::Capacity("http limiter closed".into()))?;

        let method: reqwest::Method = cfg
            .method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| FlowError::InvalidDefinition(format!("invalid method '{}'", cfg.method)))?;

        let mut request = self
            .client
            .request(method, &cfg.url)
            .timeout(Duration::from_millis(cfg.timeout_ms.unwrap_or(ctx.timeout.as_millis() as u64)));

        for (name, value) in &cfg.headers {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(name, rendered);
        }
        if !cfg.query.is_empty() {
            let pairs: Vec<(String, String)> = cfg
                .query
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = &cfg.body {
            request = match body {
                Value::String(raw) => request.body(raw.clone()),
                other => request.json(other),
            };
        }

        debug!(url = %cfg.url, "dispatching http request");
        let send = request.send();
        let response = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = send => result.map_err(map_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            );
        }
        let content_type = headers
            .get("content-type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        let size = bytes.len();

        let mut artifacts = Vec::new();
        let (body, body_raw) = if size > INLINE_LIMIT_BYTES {
            // Large bodies become artifacts with opaque references.
            let content_ref = self.artifacts.put(bytes.to_vec()).await?;
            artifacts.push(Artifact::by_ref(
                "response_body",
                content_type,
                size as u64,
                content_ref,
            ));
            (Value::Null, Value::Null)
        } else {
            let text = String::from_utf8_lossy(&bytes).to_string();
            let parsed: Value =
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));
            (parsed, Value::String(text))
        };

        Ok(ActionOutput {
            output: json!({
                "status": status,
                "headers": headers,
                "body": body,
                "body_raw": body_raw,
                "size_bytes": size,
            }),
            artifacts,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FlowError {
    if err.is_timeout() {
        FlowError::Timeout { elapsed_ms: 0, budget_ms: 0 }
    } else if err.is_connect() || err.is_request() {
        FlowError::handler_retryable(format!("http request failed: {err}"))
    } else {
        FlowError::handler(format!("http error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockResponse;
    use flowmesh_engine::ExecutionContext;
    use flowmesh_state::InMemoryArtifactStore;
    use uuid::Uuid;

    fn handler_with_mocks(mocks: Arc<MockRegistry>) -> HttpHandler {
        HttpHandler::new(
            reqwest::Client::new(),
            mocks,
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(Semaphore::new(100)),
        )
    }

    fn step_ctx() -> StepContext {
        StepContext {
            execution: ExecutionContext::new(Uuid::new_v4()),
            step_id: "s".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn real_request_captures_status_headers_and_typed_body() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/ping")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"count":3}"#)
            .create_async()
            .await;

        let handler = handler_with_mocks(Arc::new(MockRegistry::new()));
        let config = json!({"method": "GET", "url": format!("{}/ping", server.url())});
        let out = handler
            .execute(&step_ctx(), config, &Scope::new())
            .await
            .unwrap();

        assert_eq!(out.output["status"], 200);
        assert_eq!(out.output["body"]["ok"], true);
        // Numbers stay numeric after parsing.
        assert_eq!(out.output["body"]["count"], 3);
    }

    #[tokio::test]
    async fn request_headers_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/me")
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let handler = handler_with_mocks(Arc::new(MockRegistry::new()));
        let config = json!({
            "method": "GET",
            "url": format!("{}/me", server.url()),
            "headers": {"Authorization": "Bearer abc"},
        });
        handler
            .execute(&step_ctx(), config, &Scope::new())
            .await
            .unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn mock_urls_bypass_the_network() {
        let mocks = Arc::new(MockRegistry::new());
        mocks.configure(
            "GET",
            "mock://svc/ping",
            MockResponse {
                status: 200,
                headers: Map::new(),
                body: json!({"ok": true}),
                delay_ms: 0,
            },
        );
        let handler = handler_with_mocks(mocks);
        let out = handler
            .execute(
                &step_ctx(),
                json!({"method": "GET", "url": "mock://svc/ping"}),
                &Scope::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.output["status"], 200);
        assert_eq!(out.output["body"]["ok"], true);
    }

    #[tokio::test]
    async fn unconfigured_mock_is_handler_error() {
        let handler = handler_with_mocks(Arc::new(MockRegistry::new()));
        let err = handler
            .execute(
                &step_ctx(),
                json!({"method": "GET", "url": "mock://svc/missing"}),
                &Scope::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Handler { .. }));
    }
}
