//! Core of a geo-distributed publish/subscribe message broker: agreeing on
//! one global delivery order per topic across a cluster of nodes, without
//! owning the transport, the durable log, or the subscriber fan-out those
//! RPCs ultimately feed.
//!
//! A node that wants total order for a topic runs three layers, bottom up:
//!
//! - [`store`] — a [`store::MessageStore`] holds the in-flight entries for
//!   one topic and lets callers wait for a state transition without
//!   polling.
//! - [`topic`] — a [`topic::TopicCoordinator`] turns that store into the
//!   two protocol handlers, Propose and Stable, and a [`topic::TopicRegistry`]
//!   hands one coordinator per topic name.
//! - [`consensus`] — a [`consensus::ConsensusEngine`] drives a publisher's
//!   call through both handlers, locally and against every peer, retrying
//!   with a bumped timestamp when it loses the ordering race.
//!
//! [`peer::PeerClient`] is the seam where a real transport plugs in;
//! [`broker::ExternalBroker`] is the seam where a durable log and
//! subscriber fan-out plug in. Neither is implemented here beyond an
//! in-process stand-in used by this crate's own tests.

pub mod broker;
pub mod config;
pub mod consensus;
pub mod logging;
pub mod message;
pub mod peer;
pub mod store;
pub mod topic;

pub use broker::{BrokerError, ExternalBroker, SharedBroker};
pub use config::{Configuration, ConfigurationError};
pub use consensus::{ConsensusEngine, PublishError};
pub use message::{Message, MessageId};
pub use peer::{PeerClient, PeerError};
pub use store::{EntryState, UpsertOutcome};
pub use topic::{ProposeOutcome, StableOutcome, TopicCoordinator, TopicRegistry};
