//! Thin layer over one [`MessageStore`] implementing the two protocol RPC
//! handlers, plus the process-wide topic registry (spec.md §4.2, §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::RwLock;

use crate::broker::ExternalBroker;
use crate::message::{Message, MessageId};
use crate::store::{spawn_cleanup, EntryState, MessageStore, UpsertOutcome};

/// Result of [`TopicCoordinator::propose`].
#[derive(Debug, Clone)]
pub struct ProposeOutcome {
    pub ack: bool,
    pub message: Message,
    /// On ack: the messages this one must wait behind. On nack: the
    /// conflicting, later-ordered messages the caller lost the race to —
    /// used by the consensus engine to compute its next retry timestamp.
    pub predecessors: HashMap<MessageId, Message>,
}

/// Result of [`TopicCoordinator::stable`].
#[derive(Debug, Clone, Copy)]
pub struct StableOutcome {
    pub ack: bool,
}

/// Handles Propose and Stable for one topic against its [`MessageStore`].
pub struct TopicCoordinator {
    store: Arc<MessageStore>,
    _cleanup: tokio::task::JoinHandle<()>,
}

impl TopicCoordinator {
    pub fn new(topic: impl Into<String>, ttl: Duration, cleanup_interval: Duration, wait_channel_capacity: usize) -> Self {
        let store = Arc::new(MessageStore::new(topic, ttl, wait_channel_capacity));
        let cleanup = spawn_cleanup(store.clone(), cleanup_interval);
        Self {
            store,
            _cleanup: cleanup,
        }
    }

    pub fn topic(&self) -> &str {
        self.store.topic()
    }

    /// Installs a fresh proposal and decides whether to ack or nack it
    /// against every currently-acknowledged, later-ordered message in the
    /// topic. Installs a "not-before" barrier: this handler only returns
    /// once every strictly-later acknowledged message has either
    /// stabilized (naming us as its predecessor) or dropped out.
    pub async fn propose(&self, msg: Message) -> ProposeOutcome {
        self.store
            .upsert(msg.clone(), EntryState::Proposed, HashMap::new())
            .await;

        let acknowledged = self.store.get_by_states(&[EntryState::Acknowledged]).await;
        let mut newer = HashMap::new();
        let mut older = HashMap::new();
        for (id, candidate) in acknowledged {
            if candidate.ordering_key() > msg.ordering_key() {
                newer.insert(id, candidate);
            } else {
                older.insert(id, candidate);
            }
        }

        let ack = if newer.is_empty() {
            true
        } else {
            let predecessors = self
                .store
                .wait_for(&newer, &[EntryState::Stable, EntryState::Published])
                .await;
            predecessors.contains_key(&msg.id)
        };

        if ack {
            self.store
                .upsert(msg.clone(), EntryState::Acknowledged, older.clone())
                .await;
            ProposeOutcome {
                ack: true,
                message: msg,
                predecessors: older,
            }
        } else {
            self.store
                .upsert(msg.clone(), EntryState::NotAcknowledged, HashMap::new())
                .await;
            ProposeOutcome {
                ack: false,
                message: msg,
                predecessors: newer,
            }
        }
    }

    /// Installs the "not-after-predecessors" barrier: waits for every
    /// predecessor to publish (or drop out) before handing the message to
    /// the external broker and finalizing the entry as Published.
    ///
    /// Two Stable calls for the same id are a valid, expected occurrence —
    /// a peer may retransmit one after a timeout — and must result in
    /// exactly one call to `broker.publish`. Only the call that actually
    /// transitions the entry into Stable drives the broker handoff; a
    /// call that finds the entry already Stable (or already Published)
    /// just waits on the first call's outcome instead of racing it.
    pub async fn stable(
        &self,
        msg: Message,
        predecessors: HashMap<MessageId, Message>,
        broker: &dyn ExternalBroker,
    ) -> StableOutcome {
        let outcome = self
            .store
            .upsert(msg.clone(), EntryState::Stable, predecessors.clone())
            .await;

        match outcome {
            UpsertOutcome::AlreadyPublished => return StableOutcome { ack: true },
            UpsertOutcome::AlreadyStable => {
                let mut pending = HashMap::new();
                pending.insert(msg.id.clone(), msg.clone());
                self.store
                    .wait_for(&pending, &[EntryState::Published])
                    .await;
                let published = self.store.get_by_states(&[EntryState::Published]).await;
                return StableOutcome {
                    ack: published.contains_key(&msg.id),
                };
            }
            UpsertOutcome::Inserted | UpsertOutcome::Transitioned | UpsertOutcome::Reproposed => {}
        }

        self.store
            .wait_for(&predecessors, &[EntryState::Published])
            .await;

        match broker.publish(msg.clone()).await {
            Ok(()) => {
                self.store
                    .upsert(msg, EntryState::Published, predecessors)
                    .await;
                StableOutcome { ack: true }
            }
            Err(err) => {
                error!("broker publish failed for message {}: {err}", msg.id);
                StableOutcome { ack: false }
            }
        }
    }
}

/// Process-wide `topic name -> TopicCoordinator` table. Coordinators are
/// created lazily on first reference and never removed while the process
/// is alive (spec.md §3, §5, §9).
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicCoordinator>>>,
    ttl: Duration,
    cleanup_interval: Duration,
    wait_channel_capacity: usize,
}

impl TopicRegistry {
    pub fn new(ttl: Duration, cleanup_interval: Duration, wait_channel_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            ttl,
            cleanup_interval,
            wait_channel_capacity,
        }
    }

    /// Returns the coordinator for `topic`, creating it on first reference.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicCoordinator> {
        if let Some(existing) = self.topics.read().await.get(topic) {
            return existing.clone();
        }

        let mut topics = self.topics.write().await;
        if let Some(existing) = topics.get(topic) {
            return existing.clone();
        }

        info!("creating new topic coordinator for '{topic}'");
        let coordinator = Arc::new(TopicCoordinator::new(
            topic.to_string(),
            self.ttl,
            self.cleanup_interval,
            self.wait_channel_capacity,
        ));
        topics.insert(topic.to_string(), coordinator.clone());
        coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn msg(id: &str, topic: &str, ts: i64) -> Message {
        Message::new(id.to_string(), topic, ts, b"payload".to_vec())
    }

    #[tokio::test]
    async fn propose_with_no_conflicts_acks_immediately() {
        let coordinator = TopicCoordinator::new("t", Duration::from_secs(10), Duration::from_secs(20), 8);
        let outcome = coordinator.propose(msg("a", "t", 100)).await;
        assert!(outcome.ack);
        assert!(outcome.predecessors.is_empty());
    }

    #[tokio::test]
    async fn propose_acks_behind_an_older_acknowledged_message() {
        let coordinator = TopicCoordinator::new("t", Duration::from_secs(10), Duration::from_secs(20), 8);
        let first = coordinator.propose(msg("a", "t", 100)).await;
        assert!(first.ack);

        let second = coordinator.propose(msg("b", "t", 200)).await;
        assert!(second.ack);
        assert!(second.predecessors.contains_key("a"));
    }

    #[tokio::test]
    async fn propose_nacks_when_a_newer_message_never_stabilizes() {
        let coordinator = Arc::new(TopicCoordinator::new(
            "t",
            Duration::from_millis(20),
            Duration::from_secs(20),
            8,
        ));
        let later = coordinator.propose(msg("later", "t", 200)).await;
        assert!(later.ack);

        // "earlier" conflicts with an acknowledged, newer message that will
        // never stabilize (we just let its entry expire).
        let c = coordinator.clone();
        let waiter = tokio::spawn(async move { c.propose(msg("earlier", "t", 100)).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        coordinator.store.cleanup().await;

        let outcome = waiter.await.unwrap();
        assert!(!outcome.ack);
    }

    #[tokio::test]
    async fn stable_waits_for_predecessors_before_publishing() {
        let coordinator = Arc::new(TopicCoordinator::new(
            "t",
            Duration::from_secs(10),
            Duration::from_secs(20),
            8,
        ));
        let broker = Arc::new(InMemoryBroker::default());

        let pred = msg("p", "t", 100);
        coordinator
            .propose(pred.clone())
            .await;

        let mut predecessors = HashMap::new();
        predecessors.insert(pred.id.clone(), pred.clone());

        let c = coordinator.clone();
        let b = broker.clone();
        let handle = tokio::spawn(async move {
            c.stable(msg("child", "t", 101), predecessors, b.as_ref()).await
        });

        tokio::task::yield_now().await;
        assert!(broker.published_bodies("t").await.is_empty());

        coordinator
            .stable(pred.clone(), HashMap::new(), broker.as_ref())
            .await;

        let outcome = handle.await.unwrap();
        assert!(outcome.ack);
        assert_eq!(broker.published_bodies("t").await.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_concurrent_stable_calls_publish_exactly_once() {
        let coordinator = Arc::new(TopicCoordinator::new(
            "t",
            Duration::from_secs(10),
            Duration::from_secs(20),
            8,
        ));
        let broker = Arc::new(InMemoryBroker::default());

        let m = msg("a", "t", 100);
        coordinator.propose(m.clone()).await;

        let (c1, b1) = (coordinator.clone(), broker.clone());
        let (m1, m2) = (m.clone(), m.clone());
        let (c2, b2) = (coordinator.clone(), broker.clone());
        let first = tokio::spawn(async move { c1.stable(m1, HashMap::new(), b1.as_ref()).await });
        let second = tokio::spawn(async move { c2.stable(m2, HashMap::new(), b2.as_ref()).await });

        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap().ack);
        assert!(second.unwrap().ack);
        assert_eq!(broker.published_bodies("t").await.len(), 1);
    }
}
