//! The collaborator interface the core hands stabilized messages to.
//!
//! The durable message log and subscriber fan-out are explicitly out of
//! scope (spec.md §1) — this module only defines the trait boundary the
//! core depends on, plus an in-memory implementation used by tests and the
//! single-node demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("external broker failed to accept message {0}")]
    PublishFailed(String),
}

/// What [`crate::topic::TopicCoordinator::stable`] hands a message to once
/// every predecessor has published: in-memory subscriber fan-out plus a
/// durable append-only log, both opaque to the core (spec.md §4.2, §6).
#[async_trait]
pub trait ExternalBroker: Send + Sync {
    /// Delivers `message` to live subscribers and appends it to the
    /// durable store. Must be idempotent: the core may call this again
    /// for the same id only if a prior call never returned (never after a
    /// successful return), since [`crate::store::MessageStore`] marks the
    /// entry Published on success.
    async fn publish(&self, message: Message) -> Result<(), BrokerError>;

    /// Returns every message previously published to `topic` with
    /// `timestamp > since`, in ascending `(timestamp, id)` order — the
    /// collaborator shape a `Subscribe(topics, sinceTimestamp)` RPC would
    /// read from (spec.md §6). Out of scope beyond this signature: no
    /// ack bookkeeping, no live streaming.
    async fn messages_since(&self, topic: &str, since: i64) -> Vec<Message>;
}

/// Minimal in-memory [`ExternalBroker`] used by tests and the demo binary.
/// Not a production durable store — no persistence across restarts.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_bodies(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExternalBroker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().await;
        let log = topics.entry(message.topic.clone()).or_default();
        log.push(message);
        log.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        Ok(())
    }

    async fn messages_since(&self, topic: &str, since: i64) -> Vec<Message> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.timestamp > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// An [`ExternalBroker`] that always fails, for exercising the "external
/// broker failure during Stable" error path (spec.md §7).
pub struct FailingBroker;

#[async_trait]
impl ExternalBroker for FailingBroker {
    async fn publish(&self, message: Message) -> Result<(), BrokerError> {
        Err(BrokerError::PublishFailed(message.id))
    }

    async fn messages_since(&self, _topic: &str, _since: i64) -> Vec<Message> {
        Vec::new()
    }
}

pub type SharedBroker = Arc<dyn ExternalBroker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_broker_orders_by_timestamp_then_id() {
        let broker = InMemoryBroker::new();
        broker
            .publish(Message::new("b".into(), "t", 200, b"B".to_vec()))
            .await
            .unwrap();
        broker
            .publish(Message::new("a".into(), "t", 100, b"A".to_vec()))
            .await
            .unwrap();

        let bodies = broker.published_bodies("t").await;
        assert_eq!(bodies, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn messages_since_filters_by_timestamp() {
        let broker = InMemoryBroker::new();
        broker
            .publish(Message::new("a".into(), "t", 100, b"A".to_vec()))
            .await
            .unwrap();
        broker
            .publish(Message::new("b".into(), "t", 200, b"B".to_vec()))
            .await
            .unwrap();

        let recent = broker.messages_since("t", 100).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "b");
    }
}
