// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh action handlers.
//!
//! Protocol-specific implementations of the engine's `ActionHandler`
//! contract: HTTP, database, message bus, gRPC, WebSocket, browser, shell,
//! and the mock endpoint registry. The [`factory::HandlerFactory`] wires
//! them with their long-lived clients and per-protocol limits.

pub mod browser;
pub mod bus;
pub mod database;
pub mod factory;
pub mod grpc;
pub mod http;
pub mod mock;
pub mod shell;
pub mod websocket;

pub use browser::{BrowserDriver, BrowserHandler, RecordingDriver};
pub use bus::{BusMessage, InMemoryBus, KafkaConsumeHandler, KafkaPublishHandler, MessageBus};
pub use database::DatabaseHandler;
pub use factory::{HandlerFactory, ProtocolLimits, DEFAULT_PROTOCOL_LIMIT};
pub use grpc::GrpcHandler;
pub use http::HttpHandler;
pub use mock::{MockConfigureHandler, MockRegistry, MockResponse};
pub use shell::ShellHandler;
pub use websocket::{
    WebsocketConnectHandler, WebsocketReceiveHandler, WebsocketSendHandler, WsConnectionTable,
};
