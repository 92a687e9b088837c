//! # Connection Manager
//!
//! Owns the routing table and translates table churn into transport
//! connect/disconnect calls. All access is serialized by the node actor,
//! so the manager is a plain struct; table change events are returned to
//! the caller as values and dispatched only after the mutation completes.
//!
//! The manager also answers the routing question at the heart of the
//! forwarder: [`ConnectionManager::get_target`] — which peers are the
//! next hops toward a destination. Destinations inside our close-group
//! range fan out to the destination's close group ("swarm mode"); anything
//! else takes the single closest known hop.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::identity::{Address, NodeInfo};
use crate::table::{AddOutcome, GROUP_SIZE, RoutingTable, TableChange};
use crate::transport::Transport;

pub struct ConnectionManager {
    table: RoutingTable,
    transport: Arc<dyn Transport>,
    /// Peers we have initiated a Connect handshake toward but not yet
    /// added; suppresses duplicate suggestions until resolution.
    pending_connects: HashSet<Address>,
}

impl ConnectionManager {
    pub fn new(our_info: NodeInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            table: RoutingTable::new(our_info),
            transport,
            pending_connects: HashSet::new(),
        }
    }

    pub fn our_id(&self) -> Address {
        self.table.our_address()
    }

    pub fn our_info(&self) -> &NodeInfo {
        self.table.our_info()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn our_close_group(&self) -> Vec<NodeInfo> {
        self.table.our_close_group()
    }

    pub fn address_in_close_group_range(&self, address: &Address) -> bool {
        self.table.is_in_close_group(address)
    }

    /// Would we want this peer, and is no handshake already in flight?
    pub fn suggest_node_to_add(&self, address: &Address) -> bool {
        self.table.check_node(address) && !self.pending_connects.contains(address)
    }

    /// Note an outbound Connect so the peer is not suggested again while
    /// the handshake is in flight.
    pub fn mark_connect_pending(&mut self, address: Address) {
        self.pending_connects.insert(address);
    }

    /// Admit a peer: table first, then the transport connection.
    ///
    /// If the transport cannot open the connection the entry is dropped
    /// again immediately and the error is returned. An eviction closes the
    /// victim's transport connection.
    pub async fn add_node(&mut self, info: NodeInfo) -> (Result<AddOutcome>, Vec<TableChange>) {
        self.pending_connects.remove(&info.address);

        let (outcome, mut events) = self.table.add_node(info.clone());
        if !outcome.added {
            return (Ok(outcome), events);
        }

        if let Some(victim) = &outcome.evicted {
            debug!(
                peer = %&victim.address.to_hex()[..16],
                "closing transport connection to evicted peer"
            );
            self.transport.remove(victim.address).await;
        }

        if let Err(error) = self
            .transport
            .add(info.address, &info.contact)
            .await
            .context("transport add failed")
        {
            warn!(
                peer = %&info.address.to_hex()[..16],
                %error,
                "dropping peer after transport add failure"
            );
            let (_, drop_events) = self.table.drop_node(&info.address, true);
            events.extend(drop_events);
            return (Err(error), events);
        }

        (Ok(outcome), events)
    }

    /// Remove a peer from the table and close its connection.
    pub async fn drop_node(
        &mut self,
        address: &Address,
        quorum_ok: bool,
    ) -> (Option<NodeInfo>, Vec<TableChange>) {
        self.pending_connects.remove(address);
        let (dropped, events) = self.table.drop_node(address, quorum_ok);
        if dropped.is_some() {
            self.transport.remove(*address).await;
        }
        (dropped, events)
    }

    /// The transport reported the connection closed; the table entry goes
    /// with it. No transport call — the connection is already gone.
    pub fn lost_network_connection(&mut self, peer: &Address) -> (Option<NodeInfo>, Vec<TableChange>) {
        self.pending_connects.remove(peer);
        let (dropped, events) = self.table.drop_node(peer, true);
        if let Some(node) = &dropped {
            warn!(
                peer = %&node.address.to_hex()[..16],
                "lost connection to routing peer"
            );
        }
        (dropped, events)
    }

    /// Next hops toward `dest`.
    ///
    /// - our own address → empty (nothing to forward; the caller handles
    ///   local delivery)
    /// - inside our close-group range → the destination's close group,
    ///   excluding ourselves (swarm mode)
    /// - otherwise → the single closest known peer
    pub fn get_target(&self, dest: &Address) -> Vec<NodeInfo> {
        if *dest == self.table.our_address() {
            return Vec::new();
        }
        if self.table.is_in_close_group(dest) {
            return self.table.closest_nodes(dest, GROUP_SIZE, false);
        }
        self.table.closest_to(dest).into_iter().collect()
    }

    /// Forward a frame to one peer, logging failures. A send error means
    /// the transport has given up on the peer; the caller decides whether
    /// to drop it.
    pub async fn send_frame(&self, peer: &Address, frame: Vec<u8>) -> Result<()> {
        self.transport.send(*peer, frame).await.map_err(|error| {
            warn!(
                peer = %&peer.to_hex()[..16],
                %error,
                "transport send failed"
            );
            error
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
