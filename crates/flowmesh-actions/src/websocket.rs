// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! WebSocket handlers: connect, send, receive.
//!
//! Connections opened by `websocket_connect` are kept in a per-execution
//! table under a connection name (default `"default"`), so later
//! `websocket_send`/`websocket_receive` steps of the same execution reuse
//! them. The factory closes an execution's connections when it finishes.

use async_trait::async_trait;
use dashmap::DashMap;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open connections keyed by `(execution, name)`.
#[derive(Default)]
pub struct WsConnectionTable {
    connections: DashMap<(Uuid, String), Arc<Mutex<WsStream>>>,
}

impl WsConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, execution_id: Uuid, name: String, stream: WsStream) {
        self.connections
            .insert((execution_id, name), Arc::new(Mutex::new(stream)));
    }

    fn get(&self, execution_id: Uuid, name: &str) -> Option<Arc<Mutex<WsStream>>> {
        self.connections
            .get(&(execution_id, name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Drops every connection belonging to an execution.
    pub fn close_for_execution(&self, execution_id: Uuid) {
        self.connections.retain(|(id, _), _| *id != execution_id);
    }
}

fn default_name() -> String {
    "default".to_string()
}

/// `websocket_connect` config.
#[derive(Debug, Deserialize)]
struct ConnectConfig {
    url: String,
    #[serde(default = "default_name")]
    name: String,
}

/// Handler for `websocket_connect`.
pub struct WebsocketConnectHandler {
    table: Arc<WsConnectionTable>,
}

impl WebsocketConnectHandler {
    pub fn new(table: Arc<WsConnectionTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl ActionHandler for WebsocketConnectHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WebsocketConnect
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: ConnectConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("websocket_connect config: {e}")))?;

        debug!(url = %cfg.url, "opening websocket");
        let connect = connect_async(cfg.url.as_str());
        let (stream, response) = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = connect => result
                .map_err(|e| FlowError::handler_retryable(format!("websocket connect: {e}")))?,
        };

        self.table
            .insert(ctx.execution.execution_id(), cfg.name.clone(), stream);
        Ok(ActionOutput::value(json!({
            "connected": true,
            "name": cfg.name,
            "status": response.status().as_u16(),
        })))
    }
}

/// `websocket_send` config.
#[derive(Debug, Deserialize)]
struct SendConfig {
    #[serde(default = "default_name")]
    name: String,
    message: Value,
}

/// Handler for `websocket_send`.
pub struct WebsocketSendHandler {
    table: Arc<WsConnectionTable>,
}

impl WebsocketSendHandler {
    pub fn new(table: Arc<WsConnectionTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl ActionHandler for WebsocketSendHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WebsocketSend
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: SendConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("websocket_send config: {e}")))?;

        let connection = self
            .table
            .get(ctx.execution.execution_id(), &cfg.name)
            .ok_or_else(|| {
                FlowError::handler(format!("no open websocket named '{}'", cfg.name))
            })?;

        let text = match &cfg.message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let sent_bytes = text.len();
        connection
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| FlowError::handler(format!("websocket send: {e}")))?;

        Ok(ActionOutput::value(json!({"sent": true, "size_bytes": sent_bytes})))
    }
}

/// `websocket_receive` config.
#[derive(Debug, Deserialize)]
struct ReceiveConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_receive_timeout_ms")]
    timeout_ms: u64,
}

fn default_receive_timeout_ms() -> u64 {
    5_000
}

/// Handler for `websocket_receive`.
pub struct WebsocketReceiveHandler {
    table: Arc<WsConnectionTable>,
}

impl WebsocketReceiveHandler {
    pub fn new(table: Arc<WsConnectionTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl ActionHandler for WebsocketReceiveHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WebsocketReceive
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: ReceiveConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("websocket_receive config: {e}")))?;

        let connection = self
            .table
            .get(ctx.execution.execution_id(), &cfg.name)
            .ok_or_else(|| {
                FlowError::handler(format!("no open websocket named '{}'", cfg.name))
            })?;

        let mut guard = connection.lock().await;
        let next = tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), guard.next());
        let message = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = next => match result {
                Err(_) => {
                    return Err(FlowError::Timeout { elapsed_ms: cfg.timeout_ms, budget_ms: cfg.timeout_ms })
                }
                Ok(None) => return Err(FlowError::handler("websocket closed")),
                Ok(Some(Err(e))) => return Err(FlowError::handler(format!("websocket receive: {e}"))),
                Ok(Some(Ok(message))) => message,
            },
        };

        let body = match &message {
            Message::Text(text) => serde_json::from_str::<Value>(text)
                .unwrap_or_else(|_| Value::String(text.clone())),
            Message::Binary(data) => {
                use base64::Engine as _;
                json!({"binary_base64": base64::engine::general_purpose::STANDARD.encode(data)})
            }
            other => Value::String(format!("{other:?}")),
        };
        Ok(ActionOutput::value(json!({"body": body})))
    }
}
