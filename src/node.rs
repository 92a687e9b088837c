//! # Node Facade and Recovery Loop
//!
//! The main entry point for running a routing node. A [`Node`] is a cheap
//! handle onto a private actor owning all mutable state — the routing
//! table and connection manager, the per-frame router, and the
//! bootstrap/recovery machinery. Commands, transport events, and timers
//! all feed one actor loop, so every handler runs to completion before
//! the next begins.
//!
//! ## Joining
//!
//! [`Node::join`] spawns the actor and starts a cold join: bootstrap to
//! the supplied endpoints (falling back to the persisted peer store),
//! probe the bootstrap connection with a `FindGroup` for our own address,
//! and let the arriving close-group snapshot drive Connect handshakes.
//! Until the routing table holds peers, application sends relay through
//! the bootstrap connection; losing that connection while unattached ends
//! the session and cancels every pending task.
//!
//! ## Recovery
//!
//! A recovery timer ticks every `find_node_interval`. While the table is
//! small or a close-group member was lost since the last tick, the node
//! probes its neighbourhood with another `FindGroup`. Consecutive rounds
//! that leave the table no larger count as failures; too many failures —
//! or an empty table — schedule a full rebootstrap from the persisted
//! peer list.
//!
//! ## Observer
//!
//! The host passes an [`Observer`] capability set at join time and keeps
//! it for the node's lifetime: status transitions, delivered application
//! messages, and an optional address→key pin used when verifying signed
//! headers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::BootstrapStore;
use crate::connection::ConnectionManager;
use crate::identity::{Address, Keypair, NodeInfo};
use crate::messages::{FindGroup, MAX_DATA_SIZE, Message, serialize_frame};
use crate::pending::{PendingTasks, ResponseHandler, TaskStatus};
use crate::router::Router;
use crate::table::{CLOSE_SIZE, GROUP_SIZE, MAX_TABLE, TableChange};
use crate::transport::{BootstrapInfo, Transport, TransportEvent};

/// Default deadline for request/response round trips.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Command channel capacity; back-pressure applies when full.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Network status transitions reported to the observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Attached to the overlay; carries the current routing-table size.
    JoinedNetwork(usize),
    /// No bootstrap endpoint answered (or none were available).
    NotJoined,
    /// The bootstrap relay died before this node ever acquired peers.
    AnonymousSessionEnded,
    /// The bootstrap relay died after the node had peers but lost them.
    PartialJoinSessionEnded,
    /// The node is shutting down; no further work will run.
    ShuttingDown,
}

/// An application message terminated at this node.
#[derive(Clone, Debug)]
pub struct Delivered {
    pub source: Address,
    pub destination: Address,
    pub message_id: u64,
    pub body: Message,
}

/// Capability set the host hands over at join time, held for the node's
/// lifetime.
pub trait Observer: Send + Sync + 'static {
    fn on_network_status(&self, status: NetworkStatus);

    fn on_message(&self, message: Delivered);

    /// Optional address→public-key pin. When this returns a key for a
    /// signed frame's source, the key must match the source address or
    /// the frame is dropped. The default pins nothing.
    fn public_key_of(&self, address: &Address) -> Option<[u8; 32]> {
        let _ = address;
        None
    }
}

/// Whether a send expects a single responder or the destination's close
/// group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationKind {
    Direct,
    Group,
}

/// In-code tuning knobs. Defaults carry the production constants; tests
/// shrink the intervals.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Recovery timer period.
    pub find_node_interval: Duration,
    /// Delay between noticing an empty table and rebootstrapping.
    pub rebootstrap_lag: Duration,
    /// Consecutive fruitless find-group rounds before a forced rebootstrap.
    pub max_find_failures: u32,
    /// Table size below which the recovery timer keeps probing.
    pub routing_threshold: usize,
    /// How long seen-message fingerprints are remembered.
    pub filter_ttl: Duration,
    /// Response cache entry lifetime.
    pub cache_ttl: Duration,
    /// Response cache capacity.
    pub cache_capacity: usize,
    /// Deadline for `get_group` round trips.
    pub send_timeout: Duration,
    /// Location of the persisted bootstrap peer list, if any.
    pub bootstrap_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            find_node_interval: Duration::from_secs(30),
            rebootstrap_lag: Duration::from_secs(10),
            max_find_failures: 3,
            routing_threshold: CLOSE_SIZE,
            filter_ttl: Duration::from_secs(20 * 60),
            cache_ttl: Duration::from_secs(10 * 60),
            cache_capacity: 1024,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            bootstrap_path: None,
        }
    }
}

enum Command {
    Send {
        dest: Address,
        body: Message,
        kind: DestinationKind,
        timeout: Duration,
        handler: Option<ResponseHandler>,
    },
    Respond {
        dest: Address,
        body: Message,
        message_id: u64,
    },
    GetGroup {
        target: Address,
        reply: oneshot::Sender<Vec<Address>>,
    },
    IsInGroupRange {
        addr: Address,
        reply: oneshot::Sender<bool>,
    },
    EstimateInGroup {
        sender: Address,
        info: Address,
        reply: oneshot::Sender<bool>,
    },
    ConfirmGroupMembers {
        a: Address,
        b: Address,
        reply: oneshot::Sender<bool>,
    },
    CloseGroup {
        reply: oneshot::Sender<Vec<NodeInfo>>,
    },
    TableLen {
        reply: oneshot::Sender<usize>,
    },
    AddPeer {
        info: NodeInfo,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Public handle onto a running routing node; cheap to clone.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    our_address: Address,
}

impl Node {
    /// Spawn a node and start joining the overlay.
    ///
    /// `peers` are transport endpoints to bootstrap from; when empty the
    /// persisted bootstrap store is consulted, and if that is empty too
    /// the observer sees a single [`NetworkStatus::NotJoined`].
    pub fn join(
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        observer: Arc<dyn Observer>,
        peers: Vec<String>,
        config: NodeConfig,
    ) -> Self {
        let our_info = keypair.node_info(transport.local_contact());
        let our_address = our_info.address;

        let pending = PendingTasks::new();
        let router = Router::new(
            keypair,
            pending.clone(),
            observer.clone(),
            config.filter_ttl,
            config.cache_capacity,
            config.cache_ttl,
        );
        let conn = ConnectionManager::new(our_info, transport);
        let store = config.bootstrap_path.clone().map(BootstrapStore::new);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let actor = NodeActor {
            conn,
            router,
            pending,
            observer,
            config,
            store,
            bootstrap_peer: None,
            had_peers: false,
            close_group_lost: false,
            find_failures: 0,
            probe_in_flight: false,
            last_probe_size: 0,
            rebootstrap_at: None,
        };
        tokio::spawn(actor.run(cmd_rx, transport_events, peers));

        info!(address = %&our_address.to_hex()[..16], "node joining");
        Self {
            cmd_tx,
            our_address,
        }
    }

    pub fn our_address(&self) -> Address {
        self.our_address
    }

    /// Route a message toward `dest`.
    ///
    /// With a handler, the send registers a pending task expecting one
    /// response ([`DestinationKind::Direct`]) or [`GROUP_SIZE`] responses
    /// ([`DestinationKind::Group`]); the handler fires exactly once.
    /// Invalid destinations and empty or oversized payloads invoke the
    /// handler immediately with an empty response list and touch no
    /// network.
    pub async fn send(
        &self,
        dest: Address,
        body: Message,
        kind: DestinationKind,
        timeout: Duration,
        handler: Option<ResponseHandler>,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::Send {
                dest,
                body,
                kind,
                timeout,
                handler,
            })
            .await;
    }

    /// Answer a previously delivered request: the response reuses the
    /// request's message id so it correlates at the requester.
    pub async fn respond(&self, dest: Address, body: Message, message_id: u64) {
        let _ = self
            .cmd_tx
            .send(Command::Respond {
                dest,
                body,
                message_id,
            })
            .await;
    }

    /// Resolve the close group of `target`: the returned addresses are the
    /// responding member's view, empty on timeout.
    pub async fn get_group(&self, target: Address) -> Vec<Address> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetGroup { target, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Is `addr` within this node's close-group range (local view)?
    pub async fn is_in_group_range(&self, addr: Address) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::IsInGroupRange { addr, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Estimate whether `sender` belongs to the close group of `info`.
    pub async fn estimate_in_group(&self, sender: Address, info: Address) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::EstimateInGroup {
                sender,
                info,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Do `a` and `b` mutually fall in each other's close group, as far
    /// as this node can tell?
    pub async fn confirm_group_members(&self, a: Address, b: Address) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ConfirmGroupMembers { a, b, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn close_group(&self) -> Vec<NodeInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::CloseGroup { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn routing_table_len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TableLen { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Admit a peer whose record is already known and trusted, skipping
    /// the Connect handshake. This is the zero-state join aid: the very
    /// first nodes of a network know each other out of band and wire up
    /// directly. Returns whether the table accepted the peer.
    pub async fn add_known_peer(&self, info: NodeInfo) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::AddPeer { info, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the actor; pending tasks cancel with
    /// [`TaskStatus::Shutdown`] and the observer sees
    /// [`NetworkStatus::ShuttingDown`].
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

struct NodeActor {
    conn: ConnectionManager,
    router: Router,
    pending: PendingTasks,
    observer: Arc<dyn Observer>,
    config: NodeConfig,
    store: Option<BootstrapStore>,
    bootstrap_peer: Option<BootstrapInfo>,
    /// Ever had at least one routing peer; distinguishes anonymous from
    /// partial-join session loss.
    had_peers: bool,
    /// A close-group member was removed since the last recovery tick.
    close_group_lost: bool,
    find_failures: u32,
    probe_in_flight: bool,
    last_probe_size: usize,
    rebootstrap_at: Option<Instant>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        initial_peers: Vec<String>,
    ) {
        self.join_network(initial_peers).await;

        let mut recovery = tokio::time::interval(self.config.find_node_interval);
        recovery.tick().await; // immediate first tick is uninteresting

        loop {
            let rebootstrap_at = self.rebootstrap_at;
            let rebootstrap_timer = async move {
                match rebootstrap_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = transport_events.recv() => {
                    match event {
                        None => {
                            warn!("transport event stream ended");
                            break;
                        }
                        Some(TransportEvent::Message { peer, frame }) => {
                            let events = self
                                .router
                                .handle_frame(&mut self.conn, Some(peer), &frame)
                                .await;
                            self.dispatch_table_events(events);
                        }
                        Some(TransportEvent::Lost { peer }) => self.handle_lost(peer).await,
                    }
                }
                _ = recovery.tick() => self.handle_recovery_tick().await,
                _ = rebootstrap_timer => {
                    self.rebootstrap_at = None;
                    self.rebootstrap().await;
                }
            }
        }

        self.pending.cancel_all(TaskStatus::Shutdown);
        self.observer.on_network_status(NetworkStatus::ShuttingDown);
        debug!("node actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                dest,
                body,
                kind,
                timeout,
                handler,
            } => self.handle_send(dest, body, kind, timeout, handler).await,
            Command::Respond {
                dest,
                body,
                message_id,
            } => self.handle_respond(dest, body, message_id).await,
            Command::GetGroup { target, reply } => self.handle_get_group(target, reply).await,
            Command::IsInGroupRange { addr, reply } => {
                let _ = reply.send(self.conn.table().is_in_close_group(&addr));
            }
            Command::EstimateInGroup {
                sender,
                info,
                reply,
            } => {
                let _ = reply.send(self.estimate_in_group(&sender, &info));
            }
            Command::ConfirmGroupMembers { a, b, reply } => {
                let _ = reply.send(self.confirm_group_members(&a, &b));
            }
            Command::CloseGroup { reply } => {
                let _ = reply.send(self.conn.our_close_group());
            }
            Command::TableLen { reply } => {
                let _ = reply.send(self.conn.len());
            }
            Command::AddPeer { info, reply } => {
                if !info.verify_binding() {
                    warn!(
                        peer = %&info.address.to_hex()[..16],
                        "rejecting known peer with bad address/key binding"
                    );
                    let _ = reply.send(false);
                    return;
                }
                let (outcome, events) = self.conn.add_node(info).await;
                self.dispatch_table_events(events);
                let _ = reply.send(outcome.map(|o| o.added).unwrap_or(false));
            }
            Command::Shutdown => unreachable!("Shutdown is handled by the actor loop"),
        }
    }

    async fn handle_send(
        &mut self,
        dest: Address,
        body: Message,
        kind: DestinationKind,
        timeout: Duration,
        handler: Option<ResponseHandler>,
    ) {
        if dest.is_zero() {
            warn!("invalid destination, send aborted");
            if let Some(handler) = handler {
                handler(TaskStatus::InvalidDestination, Vec::new());
            }
            return;
        }
        if let Some(len) = body.payload_len()
            && (len == 0 || len > MAX_DATA_SIZE)
        {
            warn!(size = len, "payload size not allowed, send aborted");
            if let Some(handler) = handler {
                handler(TaskStatus::DataTooLarge, Vec::new());
            }
            return;
        }

        let needed = match kind {
            DestinationKind::Group => GROUP_SIZE,
            DestinationKind::Direct => 1,
        };
        // Register before the frame can reach the transport, so a response
        // can never race its own task.
        let message_id = match handler {
            Some(handler) => self.pending.add_task(timeout, needed, handler),
            None => self.pending.next_id(),
        };

        let header = self.router.request_header_with_id(&self.conn, dest, message_id);
        let frame = match serialize_frame(&header, &body) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to serialize outbound frame");
                self.pending.cancel_task(message_id);
                return;
            }
        };
        self.send_or_relay(dest, frame, Some(message_id)).await;
    }

    async fn handle_respond(&mut self, dest: Address, body: Message, message_id: u64) {
        if dest.is_zero() {
            return;
        }
        if let Some(len) = body.payload_len()
            && (len == 0 || len > MAX_DATA_SIZE)
        {
            warn!(size = len, "payload size not allowed, response dropped");
            return;
        }
        let header = self.router.request_header_with_id(&self.conn, dest, message_id);
        match serialize_frame(&header, &body) {
            Ok(frame) => self.send_or_relay(dest, frame, None).await,
            Err(error) => warn!(%error, "failed to serialize response frame"),
        }
    }

    async fn handle_get_group(&mut self, target: Address, reply: oneshot::Sender<Vec<Address>>) {
        let handler: ResponseHandler = Box::new(move |status, responses| {
            let mut group = Vec::new();
            if status == TaskStatus::Ok
                && let Some(Message::FindGroupResponse(response)) = responses.into_iter().next()
            {
                group = response.group.into_iter().map(|node| node.address).collect();
            }
            let _ = reply.send(group);
        });
        let message_id = self.pending.add_task(self.config.send_timeout, 1, handler);

        let header = self.router.request_header_with_id(&self.conn, target, message_id);
        let body = Message::FindGroup(FindGroup {
            requester: self.conn.our_id(),
            target,
        });
        match serialize_frame(&header, &body) {
            Ok(frame) => self.send_or_relay(target, frame, Some(message_id)).await,
            Err(error) => {
                warn!(%error, "failed to serialize FindGroup");
                self.pending.cancel_task(message_id);
            }
        }
    }

    /// Route an outbound frame: locally when we own the destination,
    /// through the router when attached, through the bootstrap relay when
    /// not. A relay failure ends the anonymous/partial-join session and
    /// cancels the associated task.
    async fn send_or_relay(&mut self, dest: Address, frame: Vec<u8>, task_id: Option<u64>) {
        if dest != self.conn.our_id() && self.conn.is_empty() {
            match self.bootstrap_peer.clone() {
                Some(info) => {
                    if self.conn.transport().send(info.peer, frame).await.is_err() {
                        warn!("bootstrap relay send failed");
                        if let Some(id) = task_id {
                            self.pending.cancel_task(id);
                        }
                        self.end_relay_session();
                    }
                }
                None => {
                    debug!("send with no routing peers and no bootstrap connection");
                    if let Some(id) = task_id {
                        self.pending.cancel_task(id);
                    }
                    self.observer.on_network_status(NetworkStatus::NotJoined);
                }
            }
            return;
        }

        let events = self.router.handle_frame(&mut self.conn, None, &frame).await;
        self.dispatch_table_events(events);
    }

    fn estimate_in_group(&self, sender: &Address, info: &Address) -> bool {
        self.conn
            .table()
            .closest_nodes(info, GROUP_SIZE, true)
            .iter()
            .any(|node| node.address == *sender)
    }

    fn confirm_group_members(&self, a: &Address, b: &Address) -> bool {
        self.estimate_in_group(a, b) && self.estimate_in_group(b, a)
    }

    async fn join_network(&mut self, endpoints: Vec<String>) {
        let endpoints = if endpoints.is_empty() {
            match &self.store {
                Some(store) => store
                    .load()
                    .into_iter()
                    .map(|peer| peer.contact)
                    .collect(),
                None => Vec::new(),
            }
        } else {
            endpoints
        };
        if endpoints.is_empty() {
            info!("no bootstrap endpoints available");
            self.observer.on_network_status(NetworkStatus::NotJoined);
            return;
        }

        // Tear down any previous bootstrap connection before retrying.
        if let Some(old) = self.bootstrap_peer.take() {
            self.router.set_relay_peer(None);
            self.conn.transport().remove(old.peer).await;
        }

        match self.conn.transport().bootstrap(&endpoints).await {
            Ok(info) => {
                info!(
                    peer = %&info.peer.to_hex()[..16],
                    "bootstrapped, probing for close group"
                );
                self.router.set_relay_peer(Some(info.peer));
                self.bootstrap_peer = Some(info);
                self.find_failures = 0;
                self.probe_in_flight = false;
                self.send_find_group_via_bootstrap().await;
            }
            Err(error) => {
                warn!(%error, "bootstrap failed");
                self.observer.on_network_status(NetworkStatus::NotJoined);
            }
        }
    }

    /// FindGroup for our own address, sent straight down the bootstrap
    /// connection.
    async fn send_find_group_via_bootstrap(&mut self) {
        let Some(info) = self.bootstrap_peer.clone() else {
            return;
        };
        let our = self.conn.our_id();
        let header = self.router.request_header(&self.conn, info.peer);
        let body = Message::FindGroup(FindGroup {
            requester: our,
            target: our,
        });
        match serialize_frame(&header, &body) {
            Ok(frame) => {
                if self.conn.transport().send(info.peer, frame).await.is_err() {
                    warn!("failed to send FindGroup to bootstrap peer");
                }
            }
            Err(error) => warn!(%error, "failed to serialize bootstrap FindGroup"),
        }
    }

    /// FindGroup for our own address, fanned out to the current close
    /// group (a message routed toward one's own address goes to the
    /// neighbours who know the vicinity).
    async fn send_find_group_to_close_group(&mut self) {
        let our = self.conn.our_id();
        let header = self.router.request_header(&self.conn, our);
        let body = Message::FindGroup(FindGroup {
            requester: our,
            target: our,
        });
        let frame = match serialize_frame(&header, &body) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to serialize recovery FindGroup");
                return;
            }
        };

        debug!(
            table_size = self.conn.len(),
            "probing close group for more nodes"
        );
        for member in self.conn.our_close_group() {
            if self.conn.send_frame(&member.address, frame.clone()).await.is_err() {
                let (_, events) = self.conn.drop_node(&member.address, true).await;
                self.dispatch_table_events(events);
            }
        }
    }

    async fn handle_recovery_tick(&mut self) {
        let size = self.conn.len();

        if size == 0 {
            if self.bootstrap_peer.is_some() {
                self.find_failures += 1;
                if self.find_failures >= self.config.max_find_failures {
                    warn!(
                        failures = self.find_failures,
                        "no peers acquired through bootstrap, rebootstrapping"
                    );
                    self.find_failures = 0;
                    self.rebootstrap().await;
                } else {
                    self.send_find_group_via_bootstrap().await;
                }
            } else if self.rebootstrap_at.is_none() {
                warn!("routing table is empty, scheduling rebootstrap");
                self.rebootstrap_at = Some(Instant::now() + self.config.rebootstrap_lag);
            }
            return;
        }

        self.rebootstrap_at = None;
        let close_lost = std::mem::take(&mut self.close_group_lost);

        if size < self.config.routing_threshold || close_lost {
            if self.probe_in_flight && size <= self.last_probe_size {
                self.find_failures += 1;
                if self.find_failures >= self.config.max_find_failures {
                    warn!(
                        failures = self.find_failures,
                        table_size = size,
                        "find-group rounds stalled, rebootstrapping"
                    );
                    self.find_failures = 0;
                    self.probe_in_flight = false;
                    self.rebootstrap().await;
                    return;
                }
            } else if size > self.last_probe_size {
                self.find_failures = 0;
            }
            self.last_probe_size = size;
            self.probe_in_flight = true;
            self.send_find_group_to_close_group().await;
        } else {
            self.probe_in_flight = false;
            self.find_failures = 0;
        }
    }

    async fn rebootstrap(&mut self) {
        warn!("rebootstrapping from persisted peers");
        self.join_network(Vec::new()).await;
    }

    async fn handle_lost(&mut self, peer: Address) {
        let was_bootstrap = self
            .bootstrap_peer
            .as_ref()
            .is_some_and(|info| info.peer == peer);
        if was_bootstrap {
            warn!(
                peer = %&peer.to_hex()[..16],
                "lost bootstrap connection"
            );
            self.bootstrap_peer = None;
            self.router.set_relay_peer(None);
        }

        // The peer may also be a routing entry; the transport's report is
        // the independent evidence that lets even close-group members go.
        let was_close = self
            .conn
            .our_close_group()
            .iter()
            .any(|node| node.address == peer);
        let (dropped, events) = self.conn.lost_network_connection(&peer);
        self.dispatch_table_events(events);

        if dropped.is_some() && was_close {
            debug!("lost a close-group member, recovery will probe");
            self.close_group_lost = true;
        }

        if self.conn.is_empty() && (dropped.is_some() || was_bootstrap) {
            if was_bootstrap {
                self.end_relay_session();
            }
            if self.rebootstrap_at.is_none() {
                self.rebootstrap_at = Some(Instant::now() + self.config.rebootstrap_lag);
            }
        }
    }

    fn end_relay_session(&mut self) {
        let status = if self.had_peers {
            NetworkStatus::PartialJoinSessionEnded
        } else {
            NetworkStatus::AnonymousSessionEnded
        };
        warn!(?status, "bootstrap session ended");
        self.bootstrap_peer = None;
        self.router.set_relay_peer(None);
        self.pending.cancel_all(TaskStatus::SessionEnded);
        self.observer.on_network_status(status);
    }

    /// Dispatch table change events after the mutation that produced them
    /// has fully completed.
    fn dispatch_table_events(&mut self, events: Vec<TableChange>) {
        if events.is_empty() {
            return;
        }
        let mut removed_any = false;
        let mut close_changed = false;
        let mut size_changed = false;
        for event in &events {
            match event {
                TableChange::Added(node) => {
                    debug!(peer = %&node.address.to_hex()[..16], "peer added to routing table");
                    size_changed = true;
                }
                TableChange::Removed(node) => {
                    debug!(peer = %&node.address.to_hex()[..16], "peer removed from routing table");
                    size_changed = true;
                    removed_any = true;
                }
                TableChange::CloseGroupChanged { old, new } => {
                    trace!(old = old.len(), new = new.len(), "close group changed");
                    close_changed = true;
                }
            }
        }
        if removed_any && close_changed {
            self.close_group_lost = true;
        }
        if !self.conn.is_empty() {
            self.had_peers = true;
        }
        if size_changed {
            self.observer
                .on_network_status(NetworkStatus::JoinedNetwork(self.conn.len()));
            self.persist_peers();
        }
    }

    fn persist_peers(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let peers = self
            .conn
            .table()
            .closest_nodes(&self.conn.our_id(), MAX_TABLE, false);
        if peers.is_empty() {
            return;
        }
        if let Err(error) = store.save(&peers) {
            warn!(%error, "failed to persist bootstrap peers");
        }
    }
}
