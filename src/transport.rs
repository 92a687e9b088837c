//! # Transport Contract
//!
//! The routing core consumes a reliable-datagram transport but does not
//! implement one. The contract:
//!
//! - duplex, per-peer **ordered** delivery of opaque frames
//! - explicit add/remove of persistent peer connections
//! - asynchronous notification when a peer's connection drops
//! - a bootstrap operation that races a list of endpoints and adopts the
//!   first that answers
//!
//! Inbound traffic and loss notifications arrive as [`TransportEvent`]s
//! over the channel handed to the node at join time; outbound operations
//! are the async methods on [`Transport`]. Send is fire-and-forget from
//! the router's perspective — the transport owns per-peer queues — and a
//! send error means the transport has given up on that peer.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Address;

/// The connection adopted by a successful bootstrap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapInfo {
    pub peer: Address,
    pub contact: String,
}

/// Inbound transport notifications, delivered in per-peer order.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A serialized frame arrived from `peer`.
    Message { peer: Address, frame: Vec<u8> },
    /// The connection to `peer` is gone.
    Lost { peer: Address },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Attempt each endpoint until one answers; the returned connection is
    /// the bootstrap peer.
    async fn bootstrap(&self, endpoints: &[String]) -> Result<BootstrapInfo>;

    /// Open a persistent connection to `peer` reachable at `contact`.
    async fn add(&self, peer: Address, contact: &str) -> Result<()>;

    /// Close the connection to `peer`, if any.
    async fn remove(&self, peer: Address);

    /// Queue a frame for ordered delivery to `peer`.
    async fn send(&self, peer: Address, frame: Vec<u8>) -> Result<()>;

    /// The opaque contact handle other peers use to reach this node.
    fn local_contact(&self) -> String;
}
