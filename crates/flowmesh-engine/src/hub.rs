// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Live event hub.
//!
//! Ordered fan-out of run lifecycle events to subscribers. Each subscriber
//! owns a bounded lane (capacity 1024) with drop-oldest overflow and an
//! `event_dropped` notification. Debugger lanes are never dropped from —
//! if a debugger cannot keep up, the pause gate stalls the execution
//! instead. History is never reconstructed from the hub; the step store is
//! the source of truth.

use dashmap::DashMap;
use flowmesh_core::model::{EventType, RunEvent};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Per-subscriber buffer capacity.
pub const LANE_CAPACITY: usize = 1024;

struct Lane {
    queue: Mutex<VecDeque<RunEvent>>,
    notify: Notify,
    capacity: usize,
    /// Events dropped since the last `event_dropped` notification.
    dropped: AtomicU64,
    /// Debugger lanes grow unbounded instead of dropping.
    is_debugger: bool,
    closed: AtomicBool,
    /// Per-execution filter; `None` receives every execution.
    execution_filter: Option<Uuid>,
}

impl Lane {
    fn push(&self, event: RunEvent) {
        {
            let mut queue = self.queue.lock();
            if !self.is_debugger && queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving half of a hub subscription.
pub struct Subscription {
    id: Uuid,
    lane: Arc<Lane>,
    hub: Arc<HubInner>,
}

impl Subscription {
    /// Subscription id, used for unsubscribe.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receives the next event in publication order.
    ///
    /// When events were dropped under backpressure, a synthesized
    /// `event_dropped` notification is delivered before the next real
    /// event. Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            let dropped = self.lane.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                let execution_id = self.lane.execution_filter.unwrap_or(Uuid::nil());
                return Some(RunEvent::new(
                    EventType::EventDropped,
                    execution_id,
                    json!({"dropped": dropped}),
                ));
            }
            if let Some(event) = self.lane.queue.lock().pop_front() {
                return Some(event);
            }
            if self.lane.closed.load(Ordering::Acquire) {
                return None;
            }
            self.lane.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        self.lane.queue.lock().pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.lanes.remove(&self.id);
    }
}

#[derive(Default)]
struct HubInner {
    lanes: DashMap<Uuid, Arc<Lane>>,
}

/// The event hub.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe_inner(&self, execution_filter: Option<Uuid>, is_debugger: bool) -> Subscription {
        let id = Uuid::new_v4();
        let lane = Arc::new(Lane {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: LANE_CAPACITY,
            dropped: AtomicU64::new(0),
            is_debugger,
            closed: AtomicBool::new(false),
            execution_filter,
        });
        self.inner.lanes.insert(id, lane.clone());
        Subscription { id, lane, hub: self.inner.clone() }
    }

    /// Subscribes to one execution's events.
    pub fn subscribe(&self, execution_id: Uuid) -> Subscription {
        self.subscribe_inner(Some(execution_id), false)
    }

    /// Subscribes to every execution (workspace channel).
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe_inner(None, false)
    }

    /// Subscribes a debugger session; its lane never drops events.
    pub fn subscribe_debugger(&self, execution_id: Uuid) -> Subscription {
        self.subscribe_inner(Some(execution_id), true)
    }

    /// Closes a subscription by id.
    pub fn unsubscribe(&self, id: Uuid) {
        if let Some((_, lane)) = self.inner.lanes.remove(&id) {
            lane.close();
        }
    }

    /// Publishes an event to every matching lane, in publication order.
    pub fn publish(&self, event: RunEvent) {
        for entry in self.inner.lanes.iter() {
            let lane = entry.value();
            let matches = lane
                .execution_filter
                .map(|id| id == event.execution_id)
                .unwrap_or(true);
            if matches {
                lane.push(event.clone());
            }
        }
    }

    /// Number of live subscriptions, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(execution_id: Uuid, step: &str) -> RunEvent {
        RunEvent::new(EventType::StepCompleted, execution_id, json!({"step_id": step}))
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let hub = EventHub::new();
        let execution_id = Uuid::new_v4();
        let mut sub = hub.subscribe(execution_id);

        for name in ["a", "b", "c"] {
            hub.publish(event(execution_id, name));
        }
        for expected in ["a", "b", "c"] {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.payload["step_id"], expected);
        }
    }

    #[tokio::test]
    async fn filter_excludes_other_executions() {
        let hub = EventHub::new();
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();
        let mut sub = hub.subscribe(mine);

        hub.publish(event(theirs, "x"));
        hub.publish(event(mine, "y"));
        let received = sub.recv().await.unwrap();
        assert_eq!(received.payload["step_id"], "y");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_notifies() {
        let hub = EventHub::new();
        let execution_id = Uuid::new_v4();
        let mut sub = hub.subscribe(execution_id);

        for i in 0..(LANE_CAPACITY + 10) {
            hub.publish(event(execution_id, &format!("s{i}")));
        }

        // First delivery reports the drop.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::EventDropped);
        assert_eq!(first.payload["dropped"], 10);

        // The oldest surviving event is s10.
        let second = sub.recv().await.unwrap();
        assert_eq!(second.payload["step_id"], "s10");
    }

    #[tokio::test]
    async fn debugger_lane_never_drops() {
        let hub = EventHub::new();
        let execution_id = Uuid::new_v4();
        let mut sub = hub.subscribe_debugger(execution_id);

        for i in 0..(LANE_CAPACITY + 10) {
            hub.publish(event(execution_id, &format!("s{i}")));
        }
        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload["step_id"], "s0");
    }

    #[tokio::test]
    async fn workspace_channel_sees_everything() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe_all();
        hub.publish(event(Uuid::new_v4(), "x"));
        assert!(sub.recv().await.is_some());
    }
}
