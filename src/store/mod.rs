//! The per-topic in-memory table of in-flight messages (spec.md §4.1).
//!
//! One [`MessageStore`] exists per topic, guarded by a single mutex. It
//! unifies "in-flight entries" and "awaiters" so that any state transition
//! is observable by concurrent Propose/Stable handlers without polling —
//! see the "Cyclic waiter graph" design note: predecessors are held by id,
//! not by reference, and resolved back through the store at wait time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::message::{Message, MessageId};

/// Lifecycle state of one [`MessageEntry`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Proposed,
    Acknowledged,
    NotAcknowledged,
    Stable,
    Published,
    Expired,
}

impl EntryState {
    /// States from which no waiter can expect further progress: the entry
    /// either lost the race, expired, or already finished.
    fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::NotAcknowledged | EntryState::Expired | EntryState::Published
        )
    }
}

/// Outcome of [`MessageStore::upsert`], distinguishing a transition the
/// caller actually drove from a write that was ignored because the entry
/// had already moved past it. Callers that need to know whether they "own"
/// driving an entry to its next state (see
/// [`crate::topic::TopicCoordinator::stable`]'s duplicate-Stable handling)
/// branch on this rather than on the entry's current state, which could
/// have moved again by the time they checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entry existed for this id; this call created one.
    Inserted,
    /// An entry existed and this call changed its state.
    Transitioned,
    /// A fresh Proposed message replaced a prior, now-nacked entry.
    Reproposed,
    /// The entry was already Published; this call was ignored.
    AlreadyPublished,
    /// The entry was already Stable and `new_state` wasn't Published; this
    /// call was ignored.
    AlreadyStable,
}

/// Snapshot delivered to a waiter when the awaited entry changes state.
#[derive(Debug, Clone)]
struct WaitResult {
    state: EntryState,
    predecessors: HashMap<MessageId, Message>,
}

/// One in-flight message within a topic (spec.md §3, "Message entry").
struct MessageEntry {
    message: Message,
    state: EntryState,
    predecessors: HashMap<MessageId, Message>,
    wait_channels: Vec<mpsc::Sender<WaitResult>>,
    expire_at: Instant,
}

impl MessageEntry {
    fn new(
        message: Message,
        state: EntryState,
        predecessors: HashMap<MessageId, Message>,
        ttl: Duration,
    ) -> Self {
        Self {
            message,
            state,
            predecessors,
            wait_channels: Vec::new(),
            expire_at: Instant::now() + ttl,
        }
    }

    /// Registers a new waiter for this entry and returns its receiving end.
    fn create_wait_channel(&mut self, capacity: usize) -> mpsc::Receiver<WaitResult> {
        let (tx, rx) = mpsc::channel(capacity);
        self.wait_channels.push(tx);
        rx
    }

    /// Announces the current state to every registered waiter. Must be
    /// called before the entry is replaced or deleted (spec.md §9).
    fn broadcast_wait_result(&self) {
        if self.wait_channels.is_empty() {
            return;
        }
        let result = WaitResult {
            state: self.state,
            predecessors: self.predecessors.clone(),
        };
        for tx in &self.wait_channels {
            if tx.try_send(result.clone()).is_err() {
                warn!("wait channel full or closed, dropping state broadcast");
            }
        }
    }
}

/// Concurrent, per-topic table of in-flight [`MessageEntry`]s.
///
/// Guarded by a single async mutex: every operation other than
/// [`MessageStore::wait_for`] completes without suspending while holding
/// it (spec.md §5).
pub struct MessageStore {
    topic: String,
    ttl: Duration,
    /// Wait-channel buffer, sized to the cluster so a broadcast to every
    /// registered waiter never blocks (spec.md §5, §9).
    wait_channel_capacity: usize,
    entries: Mutex<HashMap<MessageId, MessageEntry>>,
}

impl MessageStore {
    pub fn new(topic: impl Into<String>, ttl: Duration, wait_channel_capacity: usize) -> Self {
        let topic = topic.into();
        info!("creating message store for topic '{topic}'");
        Self {
            topic,
            ttl,
            wait_channel_capacity: wait_channel_capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Snapshot of entries whose state is in `states`. An empty state list
    /// yields an empty snapshot, matching the original implementation's
    /// early return rather than treating it as "everything".
    pub async fn get_by_states(&self, states: &[EntryState]) -> HashMap<MessageId, Message> {
        if states.is_empty() {
            return HashMap::new();
        }
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(_, entry)| states.contains(&entry.state))
            .map(|(id, entry)| (id.clone(), entry.message.clone()))
            .collect()
    }

    /// Installs or updates an entry, applying the precedence rules that
    /// make a terminal or in-flight Stable entry immune to being clobbered
    /// by a stale or duplicate write (spec.md §4.1).
    pub async fn upsert(
        &self,
        msg: Message,
        new_state: EntryState,
        predecessors: HashMap<MessageId, Message>,
    ) -> UpsertOutcome {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(&msg.id) else {
            entries.insert(
                msg.id.clone(),
                MessageEntry::new(msg, new_state, predecessors, self.ttl),
            );
            return UpsertOutcome::Inserted;
        };

        if entry.state == EntryState::Published {
            return UpsertOutcome::AlreadyPublished;
        }
        if entry.state == EntryState::Stable && new_state != EntryState::Published {
            return UpsertOutcome::AlreadyStable;
        }
        if new_state == EntryState::Proposed {
            entry.state = EntryState::NotAcknowledged;
            entry.broadcast_wait_result();
            entries.insert(
                msg.id.clone(),
                MessageEntry::new(msg, new_state, predecessors, self.ttl),
            );
            return UpsertOutcome::Reproposed;
        }

        entry.state = new_state;
        entry.predecessors = predecessors;
        entry.broadcast_wait_result();
        UpsertOutcome::Transitioned
    }

    /// Blocks until every referenced message transitions into one of
    /// `desired_states` (contributing its predecessors) or into a terminal
    /// state (contributing nothing). Messages absent from the store are
    /// treated as already terminal — "missing ids are the same as
    /// already-published from this node's view" (spec.md §9).
    pub async fn wait_for(
        &self,
        messages: &HashMap<MessageId, Message>,
        desired_states: &[EntryState],
    ) -> HashMap<MessageId, Message> {
        let mut aggregated = HashMap::new();
        let mut pending = Vec::new();

        {
            let mut entries = self.entries.lock().await;
            for id in messages.keys() {
                let Some(entry) = entries.get_mut(id) else {
                    continue;
                };
                if desired_states.contains(&entry.state) {
                    aggregated.extend(entry.predecessors.clone());
                    continue;
                }
                if entry.state.is_terminal() {
                    continue;
                }
                pending.push(entry.create_wait_channel(self.wait_channel_capacity));
            }
        }

        if pending.is_empty() {
            return aggregated;
        }

        let desired_states = desired_states.to_vec();
        let waits = pending.into_iter().map(|mut rx| {
            let desired_states = desired_states.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Some(result) if desired_states.contains(&result.state) => {
                            return Some(result.predecessors)
                        }
                        Some(result) if result.state.is_terminal() => return None,
                        Some(_) => continue,
                        None => return None,
                    }
                }
            }
        });

        for result in futures::future::join_all(waits).await.into_iter().flatten() {
            aggregated.extend(result);
        }
        aggregated
    }

    /// Removes every entry whose deadline has passed, transitioning it to
    /// [`EntryState::Expired`] and notifying its waiters first. Intended to
    /// be driven by [`MessageStore::spawn_cleanup`] on `cleanup_interval`.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let mut removed = 0usize;

        entries.retain(|id, entry| {
            if entry.expire_at > now {
                return true;
            }
            if entry.state != EntryState::Published {
                warn!(
                    "message expired before being published topic={} id={id}",
                    self.topic
                );
            }
            entry.state = EntryState::Expired;
            entry.broadcast_wait_result();
            removed += 1;
            false
        });

        if removed > 0 {
            info!(
                "cleanup finished topic={} messages_removed={removed}",
                self.topic
            );
        }
    }
}

/// Runs `store.cleanup()` every `cleanup_interval` until the returned
/// handle is dropped or aborted.
pub fn spawn_cleanup(
    store: std::sync::Arc<MessageStore>,
    cleanup_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            store.cleanup().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: i64) -> Message {
        Message::new(id.to_string(), "t", ts, b"body".to_vec())
    }

    #[tokio::test]
    async fn fresh_proposal_is_accepted() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        let outcome = store
            .upsert(msg("a", 1), EntryState::Proposed, HashMap::new())
            .await;
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let snapshot = store.get_by_states(&[EntryState::Proposed]).await;
        assert!(snapshot.contains_key("a"));
    }

    #[tokio::test]
    async fn published_entry_rejects_any_upsert() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        store
            .upsert(msg("a", 1), EntryState::Published, HashMap::new())
            .await;
        let outcome = store
            .upsert(msg("a", 1), EntryState::Stable, HashMap::new())
            .await;
        assert_eq!(outcome, UpsertOutcome::AlreadyPublished);
        let snapshot = store.get_by_states(&[EntryState::Published]).await;
        assert!(snapshot.contains_key("a"));
    }

    #[tokio::test]
    async fn stable_entry_rejects_everything_but_published() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        store
            .upsert(msg("a", 1), EntryState::Stable, HashMap::new())
            .await;

        let rejected = store
            .upsert(msg("a", 1), EntryState::Acknowledged, HashMap::new())
            .await;
        assert_eq!(rejected, UpsertOutcome::AlreadyStable);
        let snapshot = store.get_by_states(&[EntryState::Stable]).await;
        assert!(snapshot.contains_key("a"));

        let accepted = store
            .upsert(msg("a", 1), EntryState::Published, HashMap::new())
            .await;
        assert_eq!(accepted, UpsertOutcome::Transitioned);
        let snapshot = store.get_by_states(&[EntryState::Published]).await;
        assert!(snapshot.contains_key("a"));
    }

    #[tokio::test]
    async fn duplicate_stable_upsert_is_flagged_rather_than_silently_reapplied() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        store
            .upsert(msg("a", 1), EntryState::Acknowledged, HashMap::new())
            .await;

        let first = store
            .upsert(msg("a", 1), EntryState::Stable, HashMap::new())
            .await;
        assert_eq!(first, UpsertOutcome::Transitioned);

        let second = store
            .upsert(msg("a", 1), EntryState::Stable, HashMap::new())
            .await;
        assert_eq!(second, UpsertOutcome::AlreadyStable);
    }

    #[tokio::test]
    async fn reproposal_replaces_and_nacks_prior_entry() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        store
            .upsert(msg("a", 1), EntryState::Acknowledged, HashMap::new())
            .await;

        let outcome = store
            .upsert(msg("a", 2), EntryState::Proposed, HashMap::new())
            .await;
        assert_eq!(outcome, UpsertOutcome::Reproposed);

        let snapshot = store.get_by_states(&[EntryState::Proposed]).await;
        let replaced = snapshot.get("a").expect("entry replaced");
        assert_eq!(replaced.timestamp, 2);
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_for_already_desired_entry() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        let mut preds = HashMap::new();
        preds.insert("p".to_string(), msg("p", 0));
        store
            .upsert(msg("a", 1), EntryState::Stable, preds.clone())
            .await;

        let mut to_wait = HashMap::new();
        to_wait.insert("a".to_string(), msg("a", 1));
        let result = store.wait_for(&to_wait, &[EntryState::Stable]).await;
        assert_eq!(result, preds);
    }

    #[tokio::test]
    async fn wait_for_ignores_absent_messages() {
        let store = MessageStore::new("t", Duration::from_secs(10), 8);
        let mut to_wait = HashMap::new();
        to_wait.insert("missing".to_string(), msg("missing", 1));
        let result = store.wait_for(&to_wait, &[EntryState::Stable]).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn wait_for_unblocks_on_later_transition() {
        let store = std::sync::Arc::new(MessageStore::new("t", Duration::from_secs(10), 8));
        store
            .upsert(msg("a", 1), EntryState::Proposed, HashMap::new())
            .await;

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut to_wait = HashMap::new();
            to_wait.insert("a".to_string(), msg("a", 1));
            waiter_store.wait_for(&to_wait, &[EntryState::Stable]).await
        });

        tokio::task::yield_now().await;
        let mut preds = HashMap::new();
        preds.insert("p".to_string(), msg("p", 0));
        store
            .upsert(msg("a", 1), EntryState::Stable, preds.clone())
            .await;

        let result = waiter.await.unwrap();
        assert_eq!(result, preds);
    }

    #[tokio::test]
    async fn wait_for_gives_up_on_terminal_transition() {
        let store = std::sync::Arc::new(MessageStore::new("t", Duration::from_secs(10), 8));
        store
            .upsert(msg("a", 1), EntryState::Proposed, HashMap::new())
            .await;

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut to_wait = HashMap::new();
            to_wait.insert("a".to_string(), msg("a", 1));
            waiter_store.wait_for(&to_wait, &[EntryState::Stable]).await
        });

        tokio::task::yield_now().await;
        store
            .upsert(msg("a", 2), EntryState::Proposed, HashMap::new())
            .await; // replaces "a" and nacks the prior entry

        let result = waiter.await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn cleanup_expires_stale_entries_and_releases_waiters() {
        let store = std::sync::Arc::new(MessageStore::new("t", Duration::from_millis(1), 8));
        store
            .upsert(msg("a", 1), EntryState::Proposed, HashMap::new())
            .await;

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut to_wait = HashMap::new();
            to_wait.insert("a".to_string(), msg("a", 1));
            waiter_store.wait_for(&to_wait, &[EntryState::Stable]).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.cleanup().await;

        let result = waiter.await.unwrap();
        assert!(result.is_empty());
        assert!(store
            .get_by_states(&[EntryState::Proposed])
            .await
            .is_empty());
    }
}
