//! The `TopicBus` storage interface: ephemeral publish/subscribe with no
//! persistence (§4.1).
//!
//! Grounded on the channel-based event emitter pattern used elsewhere in
//! this codebase (`tokio::sync::broadcast` fan-out, subscribe returns a
//! receiver, publish ignores the "no receivers" send error) generalized from
//! a single fixed channel to a per-topic registry.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopicBusError {
    #[error("backend I/O error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub topic: String,
    pub payload: Value,
}

/// A live subscription. Dropping it (or calling `unsubscribe`) stops further
/// delivery; both are equivalent here because the handle owns the receiver.
pub struct Subscription {
    topic: String,
    receiver: Option<tokio::sync::broadcast::Receiver<TopicEvent>>,
}

impl Subscription {
    pub fn new(topic: String, receiver: tokio::sync::broadcast::Receiver<TopicEvent>) -> Self {
        Self { topic, receiver: Some(receiver) }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Await the next event for this subscription. Returns `None` once the
    /// publisher side has been dropped entirely.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }
}

#[async_trait]
pub trait TopicBus: Send + Sync + 'static {
    /// Fire-and-forget. A topic with no subscribers silently discards the event.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TopicBusError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TopicBusError>;

    /// Current subscriber count for a topic, for tests and admin read models.
    async fn subscriber_count(&self, topic: &str) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryTopicBus;
    use serde_json::json;

    #[tokio::test]
    async fn zero_subscriber_publish_is_a_no_op() {
        let bus = InMemoryTopicBus::new();
        bus.publish("flow:stats", json!({"x": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = InMemoryTopicBus::new();
        let mut sub = bus.subscribe("flow:events:r1").await.unwrap();
        bus.publish("flow:events:r1", json!({"type": "step.started"})).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, json!({"type": "step.started"}));
    }
}
