//! # Weft - XOR-Overlay Routing Node Core
//!
//! Weft keeps a node continuously participating in a structured overlay
//! network organized by XOR distance over a flat 256-bit address space:
//!
//! - **Identity**: Ed25519-based addresses (32-byte public keys)
//! - **Routing Table**: bounded peer set oriented toward the node's
//!   closest neighbours, with close-group maintenance and eviction
//! - **Forwarding**: per-frame filter → cache → forward → deliver state
//!   machine with swarm-mode fan-out inside close-group range
//! - **Recovery**: bootstrap, periodic close-group rediscovery, and
//!   rebootstrap on collapse
//!
//! ## Architecture
//!
//! The core uses the **Actor Pattern**: [`Node`] is a cheap-to-clone
//! public handle; a private actor owns all mutable state and processes
//! commands, transport events, and timer ticks sequentially. The
//! transport, the cryptographic identity, the persisted bootstrap list,
//! and the host application are external collaborators behind narrow
//! interfaces ([`Transport`], [`Keypair`], [`BootstrapStore`],
//! [`Observer`]).
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API: join, send, get_group, membership oracle |
//! | `identity` | Keypairs, addresses, peer records, body signatures |
//! | `table` | XOR-metric routing table and close-group queries |
//! | `filter` | Bounded-time dedup of seen message fingerprints |
//! | `cache` | Short-TTL response cache for repeated reads |
//! | `pending` | Request/response correlation with timeouts |
//! | `messages` | Wire header, tagged bodies, frame codec |
//! | `connection` | Peer lifecycle; table churn → transport calls |
//! | `router` | Per-frame forwarding and close-group handlers |
//! | `bootstrap` | Persisted bootstrap-peer store |
//! | `transport` | Contract consumed from the datagram transport |

mod bootstrap;
mod cache;
mod connection;
mod filter;
mod identity;
mod messages;
mod node;
mod pending;
mod router;
mod table;
mod transport;

pub use bootstrap::BootstrapStore;
pub use cache::ResponseCache;
pub use filter::{FilterValue, MessageFilter};
pub use identity::{
    Address, Keypair, NodeInfo, SignatureError, distance_cmp, sign_body, verify_body,
};
pub use messages::{
    Connect, ConnectResponse, DestinationAddress, FindGroup, FindGroupResponse, GetData,
    GetDataResponse, Header, MAX_DATA_SIZE, Message, MessageTag, Post, PutData, PutDataResponse,
    SourceAddress, parse_frame, serialize_frame,
};
pub use node::{
    DEFAULT_SEND_TIMEOUT, Delivered, DestinationKind, NetworkStatus, Node, NodeConfig, Observer,
};
pub use pending::{PendingTasks, ResponseHandler, TaskStatus};
pub use table::{
    AddOutcome, BUCKET_TARGET, CLOSE_SIZE, GROUP_SIZE, MAX_TABLE, RoutingTable, TableChange,
};
pub use transport::{BootstrapInfo, Transport, TransportEvent};
