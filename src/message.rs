//! The wire-level message type and its ordering key.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Opaque, globally-unique message identifier, typically a UUID string.
pub type MessageId = String;

/// A message accepted for ordering within a single topic.
///
/// Immutable once an id has been assigned. `(topic, timestamp, id)` forms
/// the total-order key; ties on `timestamp` break lexicographically on
/// `id`. `body` is empty on the wire during Propose and populated only on
/// Stable, keeping consensus traffic small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    /// Microsecond-grain timestamp assigned by the node that first saw the
    /// message. Monotonic on that node only, not across the cluster.
    pub timestamp: i64,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId, topic: impl Into<String>, timestamp: i64, body: Vec<u8>) -> Self {
        Self {
            id,
            topic: topic.into(),
            timestamp,
            body,
        }
    }

    /// Returns a copy of this message with an empty body, suitable for the
    /// Propose leg of the protocol (body only travels on Stable).
    pub fn without_body(&self) -> Self {
        Self {
            id: self.id.clone(),
            topic: self.topic.clone(),
            timestamp: self.timestamp,
            body: Vec::new(),
        }
    }

    /// The `(timestamp, id)` ordering key used throughout the protocol.
    pub fn ordering_key(&self) -> (i64, &str) {
        (self.timestamp, self.id.as_str())
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: i64, id: &str) -> Message {
        Message::new(id.to_string(), "t", ts, b"body".to_vec())
    }

    #[test]
    fn orders_by_timestamp_then_id() {
        let a = msg(100, "a");
        let b = msg(101, "a");
        assert!(a < b);

        let c = msg(100, "a");
        let d = msg(100, "b");
        assert!(c < d);
    }

    #[test]
    fn without_body_strips_payload_but_keeps_key() {
        let m = msg(100, "a");
        let stripped = m.without_body();
        assert!(stripped.body.is_empty());
        assert_eq!(stripped.ordering_key(), m.ordering_key());
    }
}
