//! Per-peer RPC stub (spec.md §4.4). The gRPC transport itself is out of
//! scope for the core — this module only defines the trait boundary the
//! [`crate::consensus::ConsensusEngine`] fans proposals out through, plus
//! an in-process implementation used by tests and the single-node demo
//! binary to simulate a multi-node cluster without real sockets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::ExternalBroker;
use crate::message::{Message, MessageId};
use crate::topic::{ProposeOutcome, TopicRegistry};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer '{0}' unreachable: {1}")]
    Unreachable(String, String),
    #[error("peer '{0}' returned a malformed response: {1}")]
    Framing(String, String),
}

/// One long-lived connection to a peer, presenting the two consensus RPCs.
/// Both calls are synchronous request/response; a Stable call carries no
/// business-level retry here — the receiver's `TopicCoordinator` is
/// idempotent on a duplicate Stable by virtue of the upsert rules
/// (spec.md §4.4).
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Address this client was configured with, for logging.
    fn address(&self) -> &str;

    async fn propose(&self, message: Message) -> Result<ProposeOutcome, PeerError>;

    async fn stable(
        &self,
        message: Message,
        predecessors: HashMap<MessageId, Message>,
    ) -> Result<(), PeerError>;
}

/// Dispatches directly into another in-process [`TopicRegistry`], standing
/// in for the gRPC transport that is out of scope for the core. Used by
/// integration tests to simulate a multi-node cluster within one process.
pub struct LoopbackPeerClient {
    address: String,
    topics: Arc<TopicRegistry>,
    broker: Arc<dyn ExternalBroker>,
}

impl LoopbackPeerClient {
    pub fn new(address: impl Into<String>, topics: Arc<TopicRegistry>, broker: Arc<dyn ExternalBroker>) -> Self {
        Self {
            address: address.into(),
            topics,
            broker,
        }
    }
}

#[async_trait]
impl PeerClient for LoopbackPeerClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn propose(&self, message: Message) -> Result<ProposeOutcome, PeerError> {
        let coordinator = self.topics.get_or_create(&message.topic).await;
        Ok(coordinator.propose(message).await)
    }

    async fn stable(
        &self,
        message: Message,
        predecessors: HashMap<MessageId, Message>,
    ) -> Result<(), PeerError> {
        let coordinator = self.topics.get_or_create(&message.topic).await;
        coordinator.stable(message, predecessors, self.broker.as_ref()).await;
        Ok(())
    }
}

/// A peer that always fails its RPCs, for exercising the "transient peer
/// failure" and "peer outage" paths (spec.md §7, S4, S5).
pub struct UnreachablePeerClient {
    address: String,
}

impl UnreachablePeerClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl PeerClient for UnreachablePeerClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn propose(&self, _message: Message) -> Result<ProposeOutcome, PeerError> {
        Err(PeerError::Unreachable(
            self.address.clone(),
            "connection refused".to_string(),
        ))
    }

    async fn stable(
        &self,
        _message: Message,
        _predecessors: HashMap<MessageId, Message>,
    ) -> Result<(), PeerError> {
        Err(PeerError::Unreachable(
            self.address.clone(),
            "connection refused".to_string(),
        ))
    }
}

/// A peer that drops every Stable call silently while still acking
/// Propose — for exercising S5, "Stable lost in flight" (spec.md §8).
pub struct StableDroppingPeerClient {
    inner: LoopbackPeerClient,
}

impl StableDroppingPeerClient {
    pub fn new(address: impl Into<String>, topics: Arc<TopicRegistry>, broker: Arc<dyn ExternalBroker>) -> Self {
        Self {
            inner: LoopbackPeerClient::new(address, topics, broker),
        }
    }
}

#[async_trait]
impl PeerClient for StableDroppingPeerClient {
    fn address(&self) -> &str {
        self.inner.address()
    }

    async fn propose(&self, message: Message) -> Result<ProposeOutcome, PeerError> {
        self.inner.propose(message).await
    }

    async fn stable(
        &self,
        _message: Message,
        _predecessors: HashMap<MessageId, Message>,
    ) -> Result<(), PeerError> {
        Ok(()) // pretend it was delivered; the peer's entry will simply expire
    }
}
