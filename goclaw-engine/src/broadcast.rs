//! In-process pub/sub of lifecycle transitions.
//!
//! Subscribers register for the global stream or a single workflow's stream.
//! Each subscriber reads through a bounded broadcast buffer: a slow consumer
//! loses the oldest (intermediate) events but terminal events, being the
//! newest for their scope, remain readable.

use goclaw_core::EventEnvelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

pub struct EventBroadcaster {
    global: broadcast::Sender<EventEnvelope>,
    topics: RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    buffer: usize,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (global, _) = broadcast::channel(buffer.max(1));
        Self {
            global,
            topics: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Build from the configured signal mode. Distributed mode is outside
    /// the single-node core and degrades to local delivery.
    pub fn from_mode(mode: &str, buffer: usize) -> Self {
        if mode == "distributed" {
            warn!("distributed signal mode unavailable, falling back to local delivery");
        }
        Self::with_buffer(buffer)
    }

    /// Publish one envelope to the global stream and, when workflow-scoped,
    /// to that workflow's stream. Returns the number of receivers reached.
    pub fn publish(&self, event: EventEnvelope) -> usize {
        let mut reached = self.global.send(event.clone()).unwrap_or(0);
        if let Some(workflow_id) = event.workflow_id() {
            let sender = self.topics.read().get(workflow_id).cloned();
            if let Some(sender) = sender {
                reached += sender.send(event).unwrap_or(0);
            }
        }
        reached
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<EventEnvelope> {
        self.global.subscribe()
    }

    /// Subscribe to one workflow's events, in transition order.
    pub fn subscribe_workflow(&self, workflow_id: &str) -> broadcast::Receiver<EventEnvelope> {
        let mut topics = self.topics.write();
        topics
            .entry(workflow_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Drop a workflow topic with no remaining subscribers.
    pub fn prune(&self, workflow_id: &str) {
        let mut topics = self.topics.write();
        if let Some(sender) = topics.get(workflow_id) {
            if sender.receiver_count() == 0 {
                topics.remove(workflow_id);
            }
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
