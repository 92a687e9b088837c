//! # Message Router
//!
//! Per-frame state machine. Every inbound serialized frame runs through
//! the same pipeline:
//!
//! 1. parse header and body — failure drops the frame silently
//! 2. duplicate fingerprint in the filter — drop
//! 3. remember the fingerprint
//! 4. `GetDataResponse` — record in the response cache
//! 5. `GetData` with a fresh cache entry — answer from cache and halt
//! 6. forward the **original** bytes, unchanged, to every next hop toward
//!    the destination (no re-signing, no header mutation)
//! 7. destination outside our close-group range — halt
//! 8. dispatch the body to the local handler
//!
//! Step 6 runs even when step 8 will also fire: a node inside the close
//! group still forwards so the rest of the group sees the message (swarm
//! mode); the filter suppresses the copies that reflect back.
//!
//! ## Reply routing
//!
//! Replies travel toward the original source. When the request carried a
//! relay marker (`destination.reply_to`, set by senders that have not yet
//! acquired routing peers), the reply routes toward the relay, and the
//! relay hands it to the attached child over their existing connection.
//! Peers that recently delivered frames to us directly serve as a
//! fallback route for addresses with no table entry.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::cache::ResponseCache;
use crate::connection::ConnectionManager;
use crate::filter::MessageFilter;
use crate::identity::{Address, Keypair, sign_body, verify_body};
use crate::messages::{
    Connect, ConnectResponse, DestinationAddress, FindGroup, FindGroupResponse, GetDataResponse,
    Header, Message, SourceAddress, parse_frame, serialize_frame,
};
use crate::node::{Delivered, Observer};
use crate::pending::PendingTasks;
use crate::table::TableChange;

/// Bound on remembered direct senders used for reply-route fallback.
const MAX_DIRECT_PEERS: usize = 128;

pub(crate) struct Router {
    keypair: Keypair,
    filter: MessageFilter,
    cache: ResponseCache,
    pending: PendingTasks,
    observer: Arc<dyn Observer>,
    /// Peers that recently delivered frames to us over a live connection.
    /// Replies toward addresses absent from the routing table fall back to
    /// these connections (non-routing peers, in the original sense).
    direct_peers: LruCache<Address, ()>,
    /// The current bootstrap connection; carries traffic while the table
    /// is empty.
    relay_peer: Option<Address>,
}

impl Router {
    pub fn new(
        keypair: Keypair,
        pending: PendingTasks,
        observer: Arc<dyn Observer>,
        filter_ttl: Duration,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            keypair,
            filter: MessageFilter::new(filter_ttl),
            cache: ResponseCache::new(cache_capacity, cache_ttl),
            pending,
            observer,
            direct_peers: LruCache::new(
                NonZeroUsize::new(MAX_DIRECT_PEERS).expect("direct peer bound must be non-zero"),
            ),
            relay_peer: None,
        }
    }

    pub fn set_relay_peer(&mut self, relay: Option<Address>) {
        self.relay_peer = relay;
        if let Some(peer) = relay {
            self.direct_peers.put(peer, ());
        }
    }

    pub fn note_direct_peer(&mut self, peer: Address) {
        self.direct_peers.put(peer, ());
    }

    /// Run one frame through the state machine.
    ///
    /// `from` is the transport-level peer that delivered the frame; `None`
    /// for frames this node originates itself. Returns the routing-table
    /// change events the frame caused.
    pub async fn handle_frame(
        &mut self,
        conn: &mut ConnectionManager,
        from: Option<Address>,
        frame: &[u8],
    ) -> Vec<TableChange> {
        let mut events = Vec::new();

        let (header, body) = match parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%error, "dropping unparseable frame");
                return events;
            }
        };

        if let Some(peer) = from {
            self.direct_peers.put(peer, ());
        }

        let fingerprint = header.filter_value();
        if self.filter.check(&fingerprint) {
            trace!(message_id = header.message_id, "duplicate frame dropped");
            return events;
        }
        self.filter.add(fingerprint);

        // Signed headers must verify against the source's key before the
        // frame does anything else. The observer capability can pin a key
        // per address; absent that, the address is its own key.
        if let Some(signature) = &header.signature {
            let body_bytes = match body.serialize_body() {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(%error, "dropping frame with unserializable body");
                    return events;
                }
            };
            let pinned = self.observer.public_key_of(&header.source.node);
            let pin_ok = pinned.is_none_or(|key| key == *header.source.node.as_bytes());
            if !pin_ok || verify_body(&header.source.node, &body_bytes, signature).is_err() {
                warn!(
                    source = %&header.source.node.to_hex()[..16],
                    "invalid header signature, dropping frame"
                );
                return events;
            }
        }

        if let Message::GetDataResponse(response) = &body {
            self.cache.put(response.key, response.value.clone());
        }

        if let Message::GetData(request) = &body
            && let Some(value) = self.cache.get(&request.key)
        {
            debug!(
                key = %&request.key.to_hex()[..16],
                "answering GetData from cache"
            );
            let response = Message::GetDataResponse(GetDataResponse {
                key: request.key,
                value,
            });
            if header.source.node == conn.our_id() {
                self.pending.complete(header.message_id, response);
            } else {
                let reply = self.reply_header(conn, &header, header.source.node, None);
                match serialize_frame(&reply, &response) {
                    Ok(reply_frame) => {
                        events.extend(self.route_frame(conn, &reply, reply_frame, true).await);
                    }
                    Err(error) => warn!(%error, "failed to serialize cache response"),
                }
            }
            return events;
        }

        let dest = header.destination.addr;
        let our = conn.our_id();
        if dest != our {
            if body.is_response() && header.destination.reply_to.is_some() {
                // A reply traveling back through a relay: route toward the
                // relay (or hand it to our attached child if we are it);
                // never dispatch in transit.
                events.extend(self.route_frame(conn, &header, frame.to_vec(), true).await);
                return events;
            }
            // Forward first — even when the destination falls in our own
            // close group, the rest of the swarm needs to see the frame.
            events.extend(self.route_frame(conn, &header, frame.to_vec(), false).await);
            if !conn.address_in_close_group_range(&dest) {
                return events;
            }
        }

        events.extend(self.dispatch(conn, header, body).await);
        events
    }

    async fn dispatch(
        &mut self,
        conn: &mut ConnectionManager,
        header: Header,
        body: Message,
    ) -> Vec<TableChange> {
        match body {
            Message::Connect(connect) => self.handle_connect(conn, header, connect).await,
            Message::ConnectResponse(response) => {
                self.handle_connect_response(conn, header, response).await
            }
            Message::FindGroup(find_group) => {
                self.handle_find_group(conn, header, find_group).await
            }
            Message::FindGroupResponse(response) => {
                self.handle_find_group_response(conn, header, response).await
            }
            Message::GetDataResponse(_) | Message::PutDataResponse(_) => {
                self.pending.complete(header.message_id, body);
                Vec::new()
            }
            Message::GetData(_) | Message::PutData(_) | Message::Post(_) => {
                self.observer.on_message(Delivered {
                    source: header.source.node,
                    destination: header.destination.addr,
                    message_id: header.message_id,
                    body,
                });
                Vec::new()
            }
        }
    }

    /// A peer asks to join our neighbourhood: answer with our own signed
    /// record, then admit it.
    async fn handle_connect(
        &mut self,
        conn: &mut ConnectionManager,
        header: Header,
        connect: Connect,
    ) -> Vec<TableChange> {
        let requester = connect.requester;
        if !conn.suggest_node_to_add(&requester.address) {
            return Vec::new();
        }
        if !requester.verify_binding() {
            warn!(
                peer = %&requester.address.to_hex()[..16],
                "Connect with mismatched address/key binding, ignoring"
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        let response = Message::ConnectResponse(ConnectResponse {
            requester: requester.address,
            receiver: conn.our_info().clone(),
        });
        match response.serialize_body() {
            Ok(body_bytes) => {
                let signature = sign_body(&self.keypair, &body_bytes);
                let reply =
                    self.reply_header(conn, &header, requester.address, Some(signature));
                match serialize_frame(&reply, &response) {
                    Ok(frame) => events.extend(self.route_frame(conn, &reply, frame, true).await),
                    Err(error) => warn!(%error, "failed to serialize ConnectResponse"),
                }
            }
            Err(error) => warn!(%error, "failed to serialize ConnectResponse body"),
        }

        let (outcome, add_events) = conn.add_node(requester).await;
        events.extend(add_events);
        if let Err(error) = outcome {
            debug!(%error, "requester dropped after transport failure");
        }
        events
    }

    /// A peer accepted our Connect. Reject anything unsigned or forged,
    /// then admit the responder.
    async fn handle_connect_response(
        &mut self,
        conn: &mut ConnectionManager,
        header: Header,
        response: ConnectResponse,
    ) -> Vec<TableChange> {
        if response.requester != conn.our_id() {
            // Swarm spillover of someone else's handshake.
            return Vec::new();
        }

        let body_bytes = match Message::ConnectResponse(response.clone()).serialize_body() {
            Ok(bytes) => bytes,
            Err(_) => return Vec::new(),
        };
        let signature_ok = header
            .signature
            .as_deref()
            .is_some_and(|sig| verify_body(&response.receiver.address, &body_bytes, sig).is_ok());
        if !signature_ok || !response.receiver.verify_binding() {
            warn!(
                peer = %&response.receiver.address.to_hex()[..16],
                "invalid signature on ConnectResponse, peer rejected"
            );
            return Vec::new();
        }

        // The response resolves a handshake we initiated, so the
        // pending-connect mark must not veto it; only the table rules do.
        if !conn.table().check_node(&response.receiver.address) {
            return Vec::new();
        }

        let (outcome, events) = conn.add_node(response.receiver).await;
        if let Err(error) = outcome {
            debug!(%error, "responder dropped after transport failure");
        }
        events
    }

    /// Reply with a snapshot of our own record plus our close group.
    async fn handle_find_group(
        &mut self,
        conn: &mut ConnectionManager,
        header: Header,
        find_group: FindGroup,
    ) -> Vec<TableChange> {
        let mut group = vec![conn.our_info().clone()];
        group.extend(conn.our_close_group());
        let response = Message::FindGroupResponse(FindGroupResponse {
            requester: find_group.requester,
            group,
        });

        if find_group.requester == conn.our_id() {
            // Our own probe terminated here; no need for the wire.
            self.pending.complete(header.message_id, response);
            return Vec::new();
        }

        let body_bytes = match response.serialize_body() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "failed to serialize FindGroupResponse body");
                return Vec::new();
            }
        };
        let signature = sign_body(&self.keypair, &body_bytes);
        let reply = self.reply_header(conn, &header, find_group.requester, Some(signature));
        match serialize_frame(&reply, &response) {
            Ok(frame) => self.route_frame(conn, &reply, frame, true).await,
            Err(error) => {
                warn!(%error, "failed to serialize FindGroupResponse");
                Vec::new()
            }
        }
    }

    /// A close-group snapshot came back: satisfy any waiter, then court
    /// every member we would accept.
    async fn handle_find_group_response(
        &mut self,
        conn: &mut ConnectionManager,
        header: Header,
        response: FindGroupResponse,
    ) -> Vec<TableChange> {
        self.pending
            .complete(header.message_id, Message::FindGroupResponse(response.clone()));

        let mut events = Vec::new();
        for node in response.group {
            if node.address == conn.our_id() {
                continue;
            }
            if !node.verify_binding() {
                debug!(
                    peer = %&node.address.to_hex()[..16],
                    "skipping group entry with bad binding"
                );
                continue;
            }
            if !conn.suggest_node_to_add(&node.address) {
                continue;
            }

            let connect = Message::Connect(Connect {
                requester: conn.our_info().clone(),
            });
            let request = self.request_header(conn, node.address);
            match serialize_frame(&request, &connect) {
                Ok(frame) => {
                    conn.mark_connect_pending(node.address);
                    events.extend(self.route_frame(conn, &request, frame, false).await);
                }
                Err(error) => warn!(%error, "failed to serialize Connect"),
            }
        }
        events
    }

    /// Fresh outbound request header. Senders with no routing peers mark
    /// the bootstrap connection as their reply relay.
    pub fn request_header(&self, conn: &ConnectionManager, dest: Address) -> Header {
        self.request_header_with_id(conn, dest, self.pending.next_id())
    }

    pub fn request_header_with_id(
        &self,
        conn: &ConnectionManager,
        dest: Address,
        message_id: u64,
    ) -> Header {
        let reply_to = if conn.is_empty() {
            self.relay_peer.filter(|relay| *relay != dest)
        } else {
            None
        };
        Header {
            source: SourceAddress::node(conn.our_id()),
            destination: DestinationAddress {
                addr: dest,
                reply_to,
            },
            message_id,
            signature: None,
        }
    }

    /// Reply header mirroring the original: same message id, destination
    /// flipped back to the requester, relay marker copied so the reply can
    /// travel back through the requester's bootstrap connection.
    fn reply_header(
        &self,
        conn: &ConnectionManager,
        orig: &Header,
        requester: Address,
        signature: Option<Vec<u8>>,
    ) -> Header {
        Header {
            source: SourceAddress::node(conn.our_id()),
            destination: DestinationAddress {
                addr: requester,
                reply_to: orig.destination.reply_to.filter(|relay| *relay != requester),
            },
            message_id: orig.message_id,
            signature,
        }
    }

    /// Send an already-serialized frame toward its destination.
    ///
    /// With `honor_relay` (responses to relay-held requesters) the frame
    /// routes toward the relay instead of the destination, and the relay
    /// itself hands it to the attached child. Requests carry the relay
    /// marker only as reply metadata and route normally. Falls back to
    /// direct connections for addresses without table entries, and — while
    /// this node has no routing peers at all — relays through the
    /// bootstrap connection. Peers whose transport send fails are dropped
    /// from the table.
    pub async fn route_frame(
        &mut self,
        conn: &mut ConnectionManager,
        header: &Header,
        frame: Vec<u8>,
        honor_relay: bool,
    ) -> Vec<TableChange> {
        let mut events = Vec::new();
        let dest = header.destination.addr;
        let our = conn.our_id();
        if dest == our {
            return events;
        }

        let route_addr = match header.destination.reply_to.filter(|_| honor_relay) {
            Some(relay) if relay == our => {
                // We are the relay: hand the frame to the attached child
                // over its existing connection.
                if conn.send_frame(&dest, frame).await.is_err() {
                    debug!(
                        child = %&dest.to_hex()[..16],
                        "relay child unreachable, reply dropped"
                    );
                }
                return events;
            }
            Some(relay) => relay,
            None => dest,
        };

        let targets = self.forward_targets(conn, &route_addr);
        if targets.is_empty() {
            if let Some(relay) = self.relay_peer
                && relay != our
            {
                if conn.send_frame(&relay, frame).await.is_err() {
                    debug!("bootstrap relay send failed");
                }
            } else {
                debug!(
                    dest = %&route_addr.to_hex()[..16],
                    "no route toward destination, frame dropped"
                );
            }
            return events;
        }

        for target in targets {
            debug_assert!(target != our, "forwarding must never target ourselves");
            if conn.send_frame(&target, frame.clone()).await.is_err() {
                let (_, drop_events) = conn.drop_node(&target, true).await;
                events.extend(drop_events);
            }
        }
        events
    }

    fn forward_targets(&mut self, conn: &ConnectionManager, dest: &Address) -> Vec<Address> {
        let targets: Vec<Address> = conn
            .get_target(dest)
            .iter()
            .map(|node| node.address)
            .collect();
        if !targets.is_empty() {
            return targets;
        }
        // An address with no table entry may still be an attached peer that
        // spoke to us over a live connection (a non-routing peer).
        if *dest != conn.our_id() && self.direct_peers.contains(dest) {
            return vec![*dest];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GetData, Post, PutData};
    use crate::node::NetworkStatus;
    use crate::pending::TaskStatus;
    use crate::table::GROUP_SIZE;
    use crate::transport::{BootstrapInfo, Transport};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Address, Vec<u8>)>>,
        fail_sends: Mutex<HashSet<Address>>,
    }

    impl RecordingTransport {
        fn sent_frames(&self) -> Vec<(Address, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn bootstrap(&self, _endpoints: &[String]) -> Result<BootstrapInfo> {
            anyhow::bail!("not used")
        }

        async fn add(&self, _peer: Address, _contact: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _peer: Address) {}

        async fn send(&self, peer: Address, frame: Vec<u8>) -> Result<()> {
            if self.fail_sends.lock().unwrap().contains(&peer) {
                anyhow::bail!("peer unreachable");
            }
            self.sent.lock().unwrap().push((peer, frame));
            Ok(())
        }

        fn local_contact(&self) -> String {
            "mem:router".into()
        }
    }

    #[derive(Default)]
    struct CollectingObserver {
        statuses: Mutex<Vec<NetworkStatus>>,
        delivered: Mutex<Vec<Delivered>>,
    }

    impl Observer for CollectingObserver {
        fn on_network_status(&self, status: NetworkStatus) {
            self.statuses.lock().unwrap().push(status);
        }

        fn on_message(&self, message: Delivered) {
            self.delivered.lock().unwrap().push(message);
        }
    }

    struct Fixture {
        keypair: Keypair,
        router: Router,
        conn: ConnectionManager,
        transport: Arc<RecordingTransport>,
        observer: Arc<CollectingObserver>,
        pending: PendingTasks,
    }

    fn fixture() -> Fixture {
        let keypair = Keypair::generate();
        let transport = Arc::new(RecordingTransport::default());
        let observer = Arc::new(CollectingObserver::default());
        let pending = PendingTasks::new();
        let conn = ConnectionManager::new(keypair.node_info("mem:router"), transport.clone());
        let router = Router::new(
            keypair.clone(),
            pending.clone(),
            observer.clone(),
            Duration::from_secs(60),
            64,
            Duration::from_secs(60),
        );
        Fixture {
            keypair,
            router,
            conn,
            transport,
            observer,
            pending,
        }
    }

    fn peer_info(seed: u8) -> (Keypair, crate::identity::NodeInfo) {
        let kp = Keypair::generate();
        let info = kp.node_info(format!("mem:peer{seed}"));
        (kp, info)
    }

    async fn populate(fixture: &mut Fixture, n: u8) -> Vec<Address> {
        let mut peers = Vec::new();
        for seed in 0..n {
            let (_, info) = peer_info(seed);
            let address = info.address;
            fixture.conn.add_node(info).await.0.unwrap();
            peers.push(address);
        }
        fixture.transport.sent.lock().unwrap().clear();
        peers
    }

    fn frame_tag(frame: &[u8]) -> crate::messages::MessageTag {
        parse_frame(frame).unwrap().1.tag()
    }

    #[tokio::test]
    async fn garbage_frames_dropped_silently() {
        let mut fx = fixture();
        let events = fx
            .router
            .handle_frame(&mut fx.conn, None, &[0xDE, 0xAD, 0xBE, 0xEF])
            .await;
        assert!(events.is_empty());
        assert!(fx.transport.sent_frames().is_empty());
        assert!(fx.observer.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_frames_dropped() {
        let mut fx = fixture();
        populate(&mut fx, 4).await;

        let (sender, _) = peer_info(99);
        let header = Header {
            source: SourceAddress::node(sender.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 7,
            signature: None,
        };
        let body = Message::Post(Post {
            payload: b"hello".to_vec(),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;
        fx.router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;

        assert_eq!(
            fx.observer.delivered.lock().unwrap().len(),
            1,
            "filter must suppress the second delivery"
        );
    }

    #[tokio::test]
    async fn forwards_before_local_dispatch_and_never_to_self() {
        let mut fx = fixture();
        let peers = populate(&mut fx, 12).await;

        // A frame destined to our own neighbourhood: swarm-forwarded AND
        // delivered locally.
        let (sender, _) = peer_info(50);
        let mut dest_bytes = *fx.conn.our_id().as_bytes();
        dest_bytes[31] ^= 1;
        let dest = Address::from_bytes(dest_bytes);
        assert!(fx.conn.address_in_close_group_range(&dest));

        let header = Header {
            source: SourceAddress::node(sender.address()),
            destination: DestinationAddress::direct(dest),
            message_id: 11,
            signature: None,
        };
        let body = Message::Post(Post {
            payload: b"swarm".to_vec(),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;

        let sent = fx.transport.sent_frames();
        assert_eq!(sent.len(), GROUP_SIZE, "swarm fan-out to the close group");
        for (target, forwarded) in &sent {
            assert_ne!(*target, fx.conn.our_id(), "no send target equals ourselves");
            assert!(peers.contains(target));
            assert_eq!(forwarded, &frame, "forwarded bytes must be unchanged");
        }
        assert_eq!(fx.observer.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn far_destination_single_hop_no_dispatch() {
        let mut fx = fixture();
        populate(&mut fx, 12).await;

        let (sender, _) = peer_info(51);
        // Flip the top bit of our address: maximally far.
        let mut dest_bytes = *fx.conn.our_id().as_bytes();
        dest_bytes[0] ^= 0x80;
        let dest = Address::from_bytes(dest_bytes);
        if fx.conn.address_in_close_group_range(&dest) {
            // Astronomically unlikely with 12 random peers; bail out of the
            // premise rather than assert something untrue.
            return;
        }

        let header = Header {
            source: SourceAddress::node(sender.address()),
            destination: DestinationAddress::direct(dest),
            message_id: 12,
            signature: None,
        };
        let body = Message::Post(Post {
            payload: b"far".to_vec(),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;

        assert_eq!(fx.transport.sent_frames().len(), 1, "single next hop");
        assert!(
            fx.observer.delivered.lock().unwrap().is_empty(),
            "out-of-range destination must not dispatch locally"
        );
    }

    #[tokio::test]
    async fn get_data_served_from_cache() {
        let mut fx = fixture();
        populate(&mut fx, 6).await;

        let key = Address::from_bytes([0x42; 32]);
        let (holder, _) = peer_info(60);

        // A routed GetDataResponse seeds the cache.
        let seed_header = Header {
            source: SourceAddress::node(holder.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: fx.pending.next_id(),
            signature: None,
        };
        let seed_body = Message::GetDataResponse(GetDataResponse {
            key,
            value: b"cached".to_vec(),
        });
        let seed_frame = serialize_frame(&seed_header, &seed_body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(holder.address()), &seed_frame)
            .await;
        fx.transport.sent.lock().unwrap().clear();

        // A later GetData from a direct peer is answered from cache.
        let (asker, asker_info) = peer_info(61);
        fx.conn.add_node(asker_info).await.0.unwrap();
        fx.transport.sent.lock().unwrap().clear();

        let ask_header = Header {
            source: SourceAddress::node(asker.address()),
            destination: DestinationAddress::direct(key),
            message_id: 77,
            signature: None,
        };
        let ask_frame =
            serialize_frame(&ask_header, &Message::GetData(GetData { key })).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(asker.address()), &ask_frame)
            .await;

        let sent = fx.transport.sent_frames();
        // The GetData itself is never forwarded toward the key's holders.
        assert!(
            sent.iter()
                .all(|(_, f)| frame_tag(f) != crate::messages::MessageTag::GetData),
            "cache hit must halt forwarding of the request"
        );
        let replies: Vec<_> = sent
            .iter()
            .filter(|(_, f)| frame_tag(f) == crate::messages::MessageTag::GetDataResponse)
            .collect();
        assert!(!replies.is_empty(), "a cached response must be emitted");
        let (reply_header, reply_body) = parse_frame(&replies[0].1).unwrap();
        assert_eq!(reply_header.message_id, 77);
        assert_eq!(reply_header.destination.addr, asker.address());
        assert_eq!(
            reply_body,
            Message::GetDataResponse(GetDataResponse {
                key,
                value: b"cached".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn self_sourced_get_data_resolves_from_cache() {
        let mut fx = fixture();
        populate(&mut fx, 6).await;

        let key = Address::from_bytes([0x42; 32]);
        let (holder, _) = peer_info(62);

        // A routed GetDataResponse seeds the cache.
        let seed_header = Header {
            source: SourceAddress::node(holder.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: fx.pending.next_id(),
            signature: None,
        };
        let seed_body = Message::GetDataResponse(GetDataResponse {
            key,
            value: b"cached".to_vec(),
        });
        let seed_frame = serialize_frame(&seed_header, &seed_body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(holder.address()), &seed_frame)
            .await;
        fx.transport.sent.lock().unwrap().clear();

        // Our own GetData for the cached key: there is no wire route back
        // to ourselves, so the hit must complete the pending task directly.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: crate::pending::ResponseHandler = Box::new(move |status, responses| {
            let _ = tx.send((status, responses));
        });
        let task_id = fx.pending.add_task(Duration::from_secs(5), 1, handler);

        let ask_header = Header {
            source: SourceAddress::node(fx.conn.our_id()),
            destination: DestinationAddress::direct(key),
            message_id: task_id,
            signature: None,
        };
        let ask_frame = serialize_frame(&ask_header, &Message::GetData(GetData { key })).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, None, &ask_frame)
            .await;

        let (status, responses) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("cache hit must resolve immediately, not time out")
            .expect("handler dropped");
        assert_eq!(status, TaskStatus::Ok);
        assert_eq!(
            responses,
            vec![Message::GetDataResponse(GetDataResponse {
                key,
                value: b"cached".to_vec()
            })]
        );
        // The hit halts the request: nothing was forwarded toward the
        // key's holders and no response frame hit the wire.
        assert!(fx.transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn connect_handshake_admits_peer_and_replies() {
        let mut fx = fixture();
        let (requester_kp, requester_info) = peer_info(70);

        let header = Header {
            source: SourceAddress::node(requester_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 5,
            signature: None,
        };
        let body = Message::Connect(Connect {
            requester: requester_info.clone(),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(requester_kp.address()), &frame)
            .await;

        assert!(fx.conn.table().contains(&requester_info.address));
        let sent = fx.transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, requester_kp.address());
        let (reply_header, reply_body) = parse_frame(&sent[0].1).unwrap();
        match reply_body {
            Message::ConnectResponse(ref response) => {
                assert_eq!(response.requester, requester_kp.address());
                assert_eq!(response.receiver.address, fx.conn.our_id());
            }
            other => panic!("expected ConnectResponse, got {other:?}"),
        }
        // The reply is signed over exactly the body bytes.
        let body_bytes = reply_body.serialize_body().unwrap();
        assert!(
            verify_body(
                &fx.conn.our_id(),
                &body_bytes,
                reply_header.signature.as_deref().unwrap()
            )
            .is_ok()
        );
    }

    #[tokio::test]
    async fn connect_with_forged_binding_ignored() {
        let mut fx = fixture();
        let (requester_kp, mut requester_info) = peer_info(71);
        let (other_kp, _) = peer_info(72);
        requester_info.public_key = other_kp.public_key_bytes();

        let header = Header {
            source: SourceAddress::node(requester_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 6,
            signature: None,
        };
        let frame = serialize_frame(
            &header,
            &Message::Connect(Connect {
                requester: requester_info.clone(),
            }),
        )
        .unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(requester_kp.address()), &frame)
            .await;

        assert!(!fx.conn.table().contains(&requester_info.address));
        assert!(fx.transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn connect_response_requires_valid_signature() {
        let mut fx = fixture();
        let (responder_kp, responder_info) = peer_info(73);

        let body = Message::ConnectResponse(ConnectResponse {
            requester: fx.conn.our_id(),
            receiver: responder_info.clone(),
        });
        let body_bytes = body.serialize_body().unwrap();

        // Unsigned: rejected.
        let unsigned = Header {
            source: SourceAddress::node(responder_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 8,
            signature: None,
        };
        let frame = serialize_frame(&unsigned, &body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(responder_kp.address()), &frame)
            .await;
        assert!(!fx.conn.table().contains(&responder_info.address));

        // Signed by the wrong key: rejected.
        let forged = Header {
            source: SourceAddress::node(responder_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 9,
            signature: Some(sign_body(&fx.keypair, &body_bytes)),
        };
        let frame = serialize_frame(&forged, &body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(responder_kp.address()), &frame)
            .await;
        assert!(!fx.conn.table().contains(&responder_info.address));

        // Properly signed by the responder: admitted.
        let signed = Header {
            source: SourceAddress::node(responder_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 10,
            signature: Some(sign_body(&responder_kp, &body_bytes)),
        };
        let frame = serialize_frame(&signed, &body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(responder_kp.address()), &frame)
            .await;
        assert!(fx.conn.table().contains(&responder_info.address));
    }

    #[tokio::test]
    async fn find_group_replies_with_signed_snapshot() {
        let mut fx = fixture();
        populate(&mut fx, 10).await;
        let (requester_kp, _) = peer_info(80);

        let header = Header {
            source: SourceAddress::node(requester_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 21,
            signature: None,
        };
        let frame = serialize_frame(
            &header,
            &Message::FindGroup(FindGroup {
                requester: requester_kp.address(),
                target: fx.conn.our_id(),
            }),
        )
        .unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(requester_kp.address()), &frame)
            .await;

        let sent = fx.transport.sent_frames();
        let reply = sent
            .iter()
            .find(|(_, f)| frame_tag(f) == crate::messages::MessageTag::FindGroupResponse)
            .expect("FindGroupResponse emitted");
        let (reply_header, reply_body) = parse_frame(&reply.1).unwrap();
        assert_eq!(reply_header.message_id, 21);
        match reply_body {
            Message::FindGroupResponse(response) => {
                assert_eq!(response.requester, requester_kp.address());
                assert!(
                    response
                        .group
                        .iter()
                        .any(|node| node.address == fx.conn.our_id()),
                    "snapshot includes the responder itself"
                );
                assert!(response.group.len() > 1);
            }
            other => panic!("expected FindGroupResponse, got {other:?}"),
        }
        assert!(reply_header.signature.is_some());
    }

    #[tokio::test]
    async fn find_group_response_triggers_connects() {
        let mut fx = fixture();
        let (_member_kp, member_info) = peer_info(81);
        let (origin_kp, _) = peer_info(82);

        // The snapshot arrives while we are unattached, hanging off the
        // origin as our bootstrap relay.
        fx.router.set_relay_peer(Some(origin_kp.address()));

        let header = Header {
            source: SourceAddress::node(origin_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 30,
            signature: None,
        };
        let frame = serialize_frame(
            &header,
            &Message::FindGroupResponse(FindGroupResponse {
                requester: fx.conn.our_id(),
                group: vec![member_info.clone()],
            }),
        )
        .unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(origin_kp.address()), &frame)
            .await;

        let connect_count = |frames: &[(Address, Vec<u8>)]| {
            frames
                .iter()
                .filter(|(_, f)| frame_tag(f) == crate::messages::MessageTag::Connect)
                .count()
        };
        let sent = fx.transport.sent_frames();
        assert_eq!(connect_count(&sent), 1, "a Connect must be initiated");
        let connect_frame = sent
            .iter()
            .find(|(_, f)| frame_tag(f) == crate::messages::MessageTag::Connect)
            .unwrap();
        let (connect_header, connect_body) = parse_frame(&connect_frame.1).unwrap();
        assert_eq!(connect_header.destination.addr, member_info.address);
        match connect_body {
            Message::Connect(connect) => {
                assert_eq!(connect.requester.address, fx.conn.our_id());
            }
            other => panic!("expected Connect, got {other:?}"),
        }

        // A second identical snapshot does not re-court the pending peer.
        let header2 = Header {
            message_id: 31,
            ..header
        };
        let frame2 = serialize_frame(
            &header2,
            &Message::FindGroupResponse(FindGroupResponse {
                requester: fx.conn.our_id(),
                group: vec![member_info.clone()],
            }),
        )
        .unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(origin_kp.address()), &frame2)
            .await;
        assert_eq!(connect_count(&fx.transport.sent_frames()), 1);
    }

    #[tokio::test]
    async fn responses_complete_pending_tasks() {
        let mut fx = fixture();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: crate::pending::ResponseHandler = Box::new(move |status, responses| {
            let _ = tx.send((status, responses));
        });
        let task_id = fx.pending.add_task(Duration::from_secs(5), 1, handler);

        let (responder_kp, _) = peer_info(90);
        let header = Header {
            source: SourceAddress::node(responder_kp.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: task_id,
            signature: None,
        };
        let body = Message::PutDataResponse(crate::messages::PutDataResponse {
            key: Address::from_bytes([1; 32]),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        fx.router
            .handle_frame(&mut fx.conn, Some(responder_kp.address()), &frame)
            .await;

        let (status, responses) = rx.recv().await.unwrap();
        assert_eq!(status, TaskStatus::Ok);
        assert_eq!(responses, vec![body]);
    }

    #[tokio::test]
    async fn send_failure_drops_peer() {
        let mut fx = fixture();
        let peers = populate(&mut fx, 6).await;
        fx.transport.fail_sends.lock().unwrap().extend(peers.iter());

        let (sender, _) = peer_info(91);
        let mut dest_bytes = *fx.conn.our_id().as_bytes();
        dest_bytes[31] ^= 1;
        let header = Header {
            source: SourceAddress::node(sender.address()),
            destination: DestinationAddress::direct(Address::from_bytes(dest_bytes)),
            message_id: 44,
            signature: None,
        };
        let frame = serialize_frame(
            &header,
            &Message::Post(Post {
                payload: b"x".to_vec(),
            }),
        )
        .unwrap();

        let before = fx.conn.len();
        let events = fx
            .router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;
        assert!(fx.conn.len() < before, "unreachable peers must be dropped");
        assert!(events.iter().any(|e| matches!(e, TableChange::Removed(_))));
    }

    #[tokio::test]
    async fn deliveries_include_payload_body() {
        let mut fx = fixture();
        let (sender, _) = peer_info(92);

        let header = Header {
            source: SourceAddress::node(sender.address()),
            destination: DestinationAddress::direct(fx.conn.our_id()),
            message_id: 55,
            signature: None,
        };
        let body = Message::PutData(PutData {
            key: Address::from_bytes([9; 32]),
            value: b"stored".to_vec(),
        });
        let frame = serialize_frame(&header, &body).unwrap();
        fx.router
            .handle_frame(&mut fx.conn, Some(sender.address()), &frame)
            .await;

        let delivered = fx.observer.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].source, sender.address());
        assert_eq!(delivered[0].message_id, 55);
        assert_eq!(delivered[0].body, body);
    }
}
