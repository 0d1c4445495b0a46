// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Dynamic unary gRPC handler.
//!
//! Calls are made without generated stubs: the request payload is supplied
//! as base64-encoded protobuf bytes and sent through a raw-bytes codec.
//! The response bytes come back base64-encoded for downstream assertions.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Endpoint;
use tonic::{Request, Status};
use tracing::debug;

/// Pass-through codec over raw protobuf bytes.
#[derive(Debug, Clone, Default)]
struct BytesCodec;

#[derive(Debug, Clone, Default)]
struct BytesEncoder;

#[derive(Debug, Clone, Default)]
struct BytesDecoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

/// `grpc_call` config.
#[derive(Debug, Deserialize)]
struct GrpcConfig {
    /// Endpoint URL, e.g. `http://localhost:50051`.
    endpoint: String,
    /// Fully-qualified method path, `package.Service/Method`.
    method: String,
    /// Request message as base64-encoded protobuf bytes.
    #[serde(default)]
    payload_base64: Option<String>,
    /// Metadata entries sent as ASCII headers.
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
}

/// Handler for `grpc_call`.
pub struct GrpcHandler {
    limiter: Arc<Semaphore>,
}

impl GrpcHandler {
    pub fn new(limiter: Arc<Semaphore>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl ActionHandler for GrpcHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::GrpcCall
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        use base64::Engine as _;
        let cfg: GrpcConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("grpc_call config: {e}")))?;

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FlowError::Capacity("grpc limiter closed".into()))?;

        let payload = match &cfg.payload_base64 {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| FlowError::InvalidDefinition(format!("payload_base64: {e}")))?,
            None => Vec::new(),
        };

        let path_string = format!("/{}", cfg.method.trim_start_matches('/'));
        let path = PathAndQuery::try_from(path_string.as_str())
            .map_err(|e| FlowError::InvalidDefinition(format!("invalid method path: {e}")))?;

        let endpoint = Endpoint::from_shared(cfg.endpoint.clone())
            .map_err(|e| FlowError::InvalidDefinition(format!("invalid endpoint: {e}")))?
            .timeout(ctx.timeout);

        debug!(endpoint = %cfg.endpoint, method = %cfg.method, "dispatching grpc call");
        let connect = endpoint.connect();
        let channel = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = connect => result
                .map_err(|e| FlowError::handler_retryable(format!("grpc connect: {e}")))?,
        };

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| FlowError::handler_retryable(format!("grpc not ready: {e}")))?;

        let mut request = Request::new(Bytes::from(payload));
        for (name, value) in &cfg.metadata {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if let (Ok(key), Ok(val)) = (
                name.parse::<tonic::metadata::MetadataKey<tonic::metadata::Ascii>>(),
                rendered.parse(),
            ) {
                request.metadata_mut().insert(key, val);
            }
        }

        let call = grpc.unary(request, path, BytesCodec);
        let response = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = call => result.map_err(map_status)?,
        };

        let body = response.into_inner();
        Ok(ActionOutput::value(json!({
            "status": 0,
            "payload_base64": base64::engine::general_purpose::STANDARD.encode(&body),
            "size_bytes": body.len(),
        })))
    }
}

fn map_status(status: Status) -> FlowError {
    use tonic::Code;
    let message = format!("grpc {}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
            FlowError::handler_retryable(message)
        }
        _ => FlowError::handler(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_codec_round_trips() {
        let mut codec = BytesCodec;
        // The encoder/decoder pair is exercised indirectly through tonic;
        // here we only pin the construction contract.
        let _ = codec.encoder();
        let _ = codec.decoder();
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected_before_dispatch() {
        let handler = GrpcHandler::new(Arc::new(Semaphore::new(100)));
        let ctx = StepContext {
            execution: flowmesh_engine::ExecutionContext::new(uuid::Uuid::new_v4()),
            step_id: "g".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        let err = handler
            .execute(
                &ctx,
                json!({"endpoint": "not a url", "method": "pkg.Svc/Do"}),
                &Scope::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidDefinition(_)));
    }
}
