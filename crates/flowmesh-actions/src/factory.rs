// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Handler factory.
//!
//! Long-lived protocol clients (HTTP transport, DB pools, message bus,
//! browser driver) are constructed once at process start and injected into
//! handlers here; nothing reaches for globals. Each protocol gets a
//! concurrency limiter (default 100 outbound calls).

use crate::browser::{BrowserDriver, BrowserHandler, RecordingDriver};
use crate::bus::{InMemoryBus, KafkaConsumeHandler, KafkaPublishHandler, MessageBus};
use crate::database::DatabaseHandler;
use crate::grpc::GrpcHandler;
use crate::http::HttpHandler;
use crate::mock::{MockConfigureHandler, MockRegistry};
use crate::shell::ShellHandler;
use crate::websocket::{
    WebsocketConnectHandler, WebsocketReceiveHandler, WebsocketSendHandler, WsConnectionTable,
};
use flowmesh_core::ActionKind;
use flowmesh_engine::ActionRegistry;
use flowmesh_state::{ArtifactStore, InMemoryArtifactStore};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default cap on concurrent outbound calls per protocol.
pub const DEFAULT_PROTOCOL_LIMIT: usize = 100;

/// Per-protocol concurrency caps.
#[derive(Debug, Clone)]
pub struct ProtocolLimits {
    pub http: usize,
    pub database: usize,
    pub grpc: usize,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            http: DEFAULT_PROTOCOL_LIMIT,
            database: DEFAULT_PROTOCOL_LIMIT,
            grpc: DEFAULT_PROTOCOL_LIMIT,
        }
    }
}

/// Builds and wires the full handler set.
pub struct HandlerFactory {
    limits: ProtocolLimits,
    artifacts: Arc<dyn ArtifactStore>,
    bus: Arc<dyn MessageBus>,
    browser: Arc<dyn BrowserDriver>,
    mocks: Arc<MockRegistry>,
    ws_table: Arc<WsConnectionTable>,
}

impl HandlerFactory {
    /// Factory with in-process defaults: in-memory artifact store, bus,
    /// and recording browser driver.
    pub fn new() -> Self {
        Self {
            limits: ProtocolLimits::default(),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            bus: Arc::new(InMemoryBus::new()),
            browser: Arc::new(RecordingDriver::new()),
            mocks: Arc::new(MockRegistry::new()),
            ws_table: Arc::new(WsConnectionTable::new()),
        }
    }

    pub fn with_limits(mut self, limits: ProtocolLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_browser_driver(mut self, browser: Arc<dyn BrowserDriver>) -> Self {
        self.browser = browser;
        self
    }

    /// The mock registry shared with `mock_configure` steps.
    pub fn mocks(&self) -> Arc<MockRegistry> {
        self.mocks.clone()
    }

    /// The WebSocket connection table, for per-execution cleanup.
    pub fn ws_connections(&self) -> Arc<WsConnectionTable> {
        self.ws_table.clone()
    }

    /// Registers every handler into the registry.
    pub fn install(&self, registry: &ActionRegistry) {
        sqlx::any::install_default_drivers();

        let http_limiter = Arc::new(Semaphore::new(self.limits.http));
        let db_limiter = Arc::new(Semaphore::new(self.limits.database));
        let grpc_limiter = Arc::new(Semaphore::new(self.limits.grpc));

        registry.register(Arc::new(HttpHandler::new(
            reqwest::Client::new(),
            self.mocks.clone(),
            self.artifacts.clone(),
            http_limiter,
        )));
        registry.register(Arc::new(DatabaseHandler::new(db_limiter)));
        registry.register(Arc::new(KafkaPublishHandler::new(self.bus.clone())));
        registry.register(Arc::new(KafkaConsumeHandler::new(self.bus.clone())));
        registry.register(Arc::new(GrpcHandler::new(grpc_limiter)));
        registry.register(Arc::new(WebsocketConnectHandler::new(self.ws_table.clone())));
        registry.register(Arc::new(WebsocketSendHandler::new(self.ws_table.clone())));
        registry.register(Arc::new(WebsocketReceiveHandler::new(self.ws_table.clone())));
        for kind in [
            ActionKind::BrowserNavigate,
            ActionKind::BrowserClick,
            ActionKind::BrowserFill,
            ActionKind::BrowserWaitFor,
            ActionKind::BrowserScreenshot,
        ] {
            registry.register(Arc::new(BrowserHandler::new(kind, self.browser.clone())));
        }
        registry.register(Arc::new(ShellHandler::new()));
        registry.register(Arc::new(MockConfigureHandler::new(self.mocks.clone())));
    }
}

impl Default for HandlerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_covers_every_terminal_action() {
        let registry = ActionRegistry::new();
        HandlerFactory::new().install(&registry);

        for kind in [
            ActionKind::HttpRequest,
            ActionKind::DatabaseQuery,
            ActionKind::KafkaPublish,
            ActionKind::KafkaConsume,
            ActionKind::GrpcCall,
            ActionKind::WebsocketConnect,
            ActionKind::WebsocketSend,
            ActionKind::WebsocketReceive,
            ActionKind::BrowserNavigate,
            ActionKind::BrowserClick,
            ActionKind::BrowserFill,
            ActionKind::BrowserWaitFor,
            ActionKind::BrowserScreenshot,
            ActionKind::Shell,
            ActionKind::MockConfigure,
        ] {
            assert!(registry.get(kind).is_ok(), "missing handler for {kind}");
        }
    }
}
