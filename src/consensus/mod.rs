//! Drives a single `Publish` call through Propose/Stable against the local
//! [`TopicCoordinator`] and every configured peer (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use log::warn;
use thiserror::Error;
use uuid::Uuid;

use crate::broker::SharedBroker;
use crate::config::Configuration;
use crate::message::{Message, MessageId};
use crate::peer::PeerClient;
use crate::topic::TopicRegistry;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("message '{id}' was not cluster-stable after {attempts} attempts")]
    Exhausted { id: MessageId, attempts: u32 },
}

/// Assigns timestamps, fans proposals out to peers, and decides when a
/// message has reached quorum (spec.md §2, §4.3).
pub struct ConsensusEngine {
    topics: Arc<TopicRegistry>,
    broker: SharedBroker,
    peers: Vec<Arc<dyn PeerClient>>,
    quorum_size: usize,
    max_attempts: u32,
}

impl ConsensusEngine {
    pub fn new(config: &Configuration, broker: SharedBroker, peers: Vec<Arc<dyn PeerClient>>) -> Self {
        let wait_channel_capacity = config.cluster_size().max(1);
        let topics = Arc::new(TopicRegistry::new(
            config.message_ttl,
            config.cleanup_interval,
            wait_channel_capacity,
        ));
        Self::with_topics(config, topics, broker, peers)
    }

    /// As [`ConsensusEngine::new`], but against a caller-supplied registry
    /// instead of a freshly created one. A real transport would route
    /// incoming peer RPCs into this same registry (see [`Self::topics`]);
    /// tests use it to let several in-process "nodes" share one registry
    /// each and reference each other's through [`crate::peer::LoopbackPeerClient`].
    pub fn with_topics(
        config: &Configuration,
        topics: Arc<TopicRegistry>,
        broker: SharedBroker,
        peers: Vec<Arc<dyn PeerClient>>,
    ) -> Self {
        Self {
            topics,
            broker,
            peers,
            quorum_size: config.quorum_size(),
            max_attempts: config.max_publish_attempts,
        }
    }

    /// Exposes the registry so a transport layer (out of scope here) can
    /// route incoming peer RPCs to the same coordinators this engine uses.
    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    /// Publishes `body` to `topic`, blocking until the message is
    /// cluster-stable or every retry attempt has been exhausted.
    ///
    /// With no configured peers this degrades to a direct local publish:
    /// there is no quorum to seek, so the message is its own cluster.
    pub async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<MessageId, PublishError> {
        let id = Uuid::new_v4().to_string();

        if self.peers.is_empty() {
            let msg = Message::new(id.clone(), topic, now_micros(), body);
            let coordinator = self.topics.get_or_create(topic).await;
            coordinator.propose(msg.clone()).await;
            let outcome = coordinator.stable(msg, HashMap::new(), self.broker.as_ref()).await;
            if !outcome.ack {
                warn!("local publish of '{id}' on '{topic}' was not acknowledged by the broker");
            }
            return Ok(id);
        }

        let coordinator = self.topics.get_or_create(topic).await;
        let mut timestamp = now_micros();

        for _attempt in 1..=self.max_attempts {
            let candidate = Message::new(id.clone(), topic, timestamp, Vec::new());

            let local = coordinator.propose(candidate.clone()).await;
            if !local.ack {
                timestamp = highest_timestamp(&local.predecessors, timestamp) + 1;
                continue;
            }

            let mut ack_count = 1usize;
            let mut nack_count = 0usize;
            let mut highest_seen = timestamp;
            let mut predecessors = local.predecessors;

            let responses = join_all(
                self.peers
                    .iter()
                    .map(|peer| peer.propose(candidate.clone())),
            )
            .await;

            for (peer, response) in self.peers.iter().zip(responses) {
                match response {
                    Ok(outcome) => {
                        highest_seen = highest_seen.max(highest_timestamp(&outcome.predecessors, timestamp));
                        predecessors.extend(outcome.predecessors);
                        if outcome.ack {
                            ack_count += 1;
                        } else {
                            nack_count += 1;
                        }
                    }
                    Err(err) => {
                        warn!("peer '{}' unreachable during propose of '{id}': {err}", peer.address());
                    }
                }
                if ack_count >= self.quorum_size || nack_count >= self.quorum_size {
                    break;
                }
            }

            if ack_count >= self.quorum_size {
                let stable_msg = Message::new(id.clone(), topic, timestamp, body);
                for peer in &self.peers {
                    let peer = peer.clone();
                    let msg = stable_msg.clone();
                    let preds = predecessors.clone();
                    tokio::spawn(async move {
                        if let Err(err) = peer.stable(msg, preds).await {
                            warn!("peer '{}' failed to receive Stable: {err}", peer.address());
                        }
                    });
                }

                let outcome = coordinator
                    .stable(stable_msg, predecessors, self.broker.as_ref())
                    .await;
                if !outcome.ack {
                    warn!("local broker did not accept stable message '{id}'");
                }
                return Ok(id);
            }

            timestamp = highest_seen + 1;
        }

        Err(PublishError::Exhausted {
            id,
            attempts: self.max_attempts,
        })
    }
}

fn highest_timestamp(predecessors: &HashMap<MessageId, Message>, floor: i64) -> i64 {
    predecessors
        .values()
        .map(|m| m.timestamp)
        .fold(floor, i64::max)
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as i64
}
