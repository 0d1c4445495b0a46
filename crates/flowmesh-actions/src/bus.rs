// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Kafka-style message bus handlers.
//!
//! The protocol client is injected behind the [`MessageBus`] trait per the
//! handler-factory contract; production wiring supplies a broker-backed
//! client at startup, and the in-memory bus here backs hermetic tests and
//! mock-driven flows.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One message on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub payload: Value,
    pub offset: u64,
    pub timestamp_ms: i64,
}

/// Injected message-bus client.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message, returning its offset.
    async fn publish(&self, topic: &str, key: Option<String>, payload: Value) -> Result<u64>;

    /// Consumes up to `max_messages` for a consumer group, waiting up to
    /// `timeout` for the first message.
    async fn consume(
        &self,
        topic: &str,
        group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<BusMessage>>;
}

struct Topic {
    messages: Mutex<Vec<BusMessage>>,
    notify: Notify,
}

/// Process-local bus with per-group offsets.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, Arc<Topic>>,
    group_offsets: DashMap<(String, String), u64>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Topic { messages: Mutex::new(Vec::new()), notify: Notify::new() })
            })
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: Option<String>, payload: Value) -> Result<u64> {
        let topic_ref = self.topic(topic);
        let offset = {
            let mut messages = topic_ref.messages.lock();
            let offset = messages.len() as u64;
            messages.push(BusMessage {
                topic: topic.to_string(),
                key,
                payload,
                offset,
                timestamp_ms: Utc::now().timestamp_millis(),
            });
            offset
        };
        topic_ref.notify.notify_waiters();
        Ok(offset)
    }

    async fn consume(
        &self,
        topic: &str,
        group: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<BusMessage>> {
        let topic_ref = self.topic(topic);
        let key = (topic.to_string(), group.to_string());
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Arm the notification before checking so a concurrent publish
            // between check and wait is not missed.
            let notified = topic_ref.notify.notified();
            let start = self.group_offsets.get(&key).map(|e| *e.value()).unwrap_or(0);
            let batch: Vec<BusMessage> = {
                let messages = topic_ref.messages.lock();
                messages
                    .iter()
                    .skip(start as usize)
                    .take(max_messages)
                    .cloned()
                    .collect()
            };
            if !batch.is_empty() {
                self.group_offsets
                    .insert(key.clone(), start + batch.len() as u64);
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

/// `kafka_publish` config.
#[derive(Debug, Deserialize)]
struct PublishConfig {
    topic: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    message: Value,
}

/// Handler for `kafka_publish`.
pub struct KafkaPublishHandler {
    bus: Arc<dyn MessageBus>,
}

impl KafkaPublishHandler {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ActionHandler for KafkaPublishHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::KafkaPublish
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: PublishConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("kafka_publish config: {e}")))?;
        let offset = self.bus.publish(&cfg.topic, cfg.key, cfg.message).await?;
        Ok(ActionOutput::value(json!({
            "topic": cfg.topic,
            "offset": offset,
        })))
    }
}

/// `kafka_consume` config.
#[derive(Debug, Deserialize)]
struct ConsumeConfig {
    topic: String,
    #[serde(default = "default_group")]
    group: String,
    #[serde(default = "default_max_messages")]
    max_messages: usize,
    #[serde(default = "default_consume_timeout_ms")]
    timeout_ms: u64,
}

fn default_group() -> String {
    "flowmesh".to_string()
}

fn default_max_messages() -> usize {
    1
}

fn default_consume_timeout_ms() -> u64 {
    5_000
}

/// Handler for `kafka_consume`.
pub struct KafkaConsumeHandler {
    bus: Arc<dyn MessageBus>,
}

impl KafkaConsumeHandler {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ActionHandler for KafkaConsumeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::KafkaConsume
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: ConsumeConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("kafka_consume config: {e}")))?;

        let consume = self.bus.consume(
            &cfg.topic,
            &cfg.group,
            cfg.max_messages,
            Duration::from_millis(cfg.timeout_ms),
        );
        let messages = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = consume => result?,
        };

        let count = messages.len();
        Ok(ActionOutput::value(json!({
            "messages": messages,
            "count": count,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_round_trip() {
        let bus = InMemoryBus::new();
        bus.publish("orders", Some("k1".into()), json!({"id": 1})).await.unwrap();
        bus.publish("orders", None, json!({"id": 2})).await.unwrap();

        let batch = bus
            .consume("orders", "g1", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload["id"], 1);
        assert_eq!(batch[1].offset, 1);
    }

    #[tokio::test]
    async fn group_offsets_advance_independently() {
        let bus = InMemoryBus::new();
        bus.publish("t", None, json!(1)).await.unwrap();

        let first = bus.consume("t", "g1", 10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.len(), 1);
        // Same group sees nothing new.
        let again = bus.consume("t", "g1", 10, Duration::from_millis(50)).await.unwrap();
        assert!(again.is_empty());
        // A fresh group starts at the beginning.
        let fresh = bus.consume("t", "g2", 10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn consume_empty_topic_times_out_with_no_messages() {
        let bus = InMemoryBus::new();
        let batch = bus
            .consume("empty", "g", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
}
