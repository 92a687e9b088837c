//! # Routing Table (XOR-Metric, Close-Group Oriented)
//!
//! A bounded set of known peers kept oriented toward this node's closest
//! neighbours in the 256-bit XOR address space.
//!
//! ## Key Concepts
//!
//! - **XOR Distance**: `distance(a, b) = a XOR b` (bitwise), compared as an
//!   unsigned 256-bit integer
//! - **Close Group**: the [`CLOSE_SIZE`] entries closest to our own address;
//!   kept whenever any peer at that distance is reachable
//! - **Bucket Index**: position of the first bit of a peer's address that
//!   differs from ours; peers in high-index buckets share a long prefix
//!   with us and are close, bucket 0 covers half the keyspace
//!
//! ## Acceptance (unidirectional interest)
//!
//! A candidate is a permitted entry if the table is not full, or it is
//! strictly closer to us than the farthest member, or its bucket holds
//! fewer than [`BUCKET_TARGET`] entries. Eviction picks the farthest member
//! not protected by the same rule: close-group members and sole bucket
//! occupants are never evicted.
//!
//! ## Change Events
//!
//! Mutations return [`TableChange`] events carrying old/new close-group
//! snapshots by value. The owner dispatches them after the mutation
//! returns; no subscriber code ever runs while the table is borrowed, and
//! the table holds no reference to any other component.
//!
//! All operations are O(N) with N ≤ [`MAX_TABLE`] = 64; no ordered
//! containers are required at this scale.

use tracing::debug;

use crate::identity::{Address, NodeInfo, distance_cmp};

/// Maximum number of entries in the routing table.
pub const MAX_TABLE: usize = 64;

/// Number of nodes that constitute the close group of any target address.
pub const GROUP_SIZE: usize = 4;

/// Number of closest entries this node actively maintains around itself.
pub const CLOSE_SIZE: usize = 8;

/// Desired minimum occupancy per prefix bucket.
pub const BUCKET_TARGET: usize = 1;

/// Result of an [`RoutingTable::add_node`] attempt.
#[derive(Clone, Debug, Default)]
pub struct AddOutcome {
    pub added: bool,
    pub evicted: Option<NodeInfo>,
    pub close_group_changed: bool,
}

/// Change event emitted by table mutations.
///
/// Events carry snapshots by value so subscribers never observe (or hold
/// onto) the table's internal containers.
#[derive(Clone, Debug)]
pub enum TableChange {
    Added(NodeInfo),
    Removed(NodeInfo),
    CloseGroupChanged {
        old: Vec<NodeInfo>,
        new: Vec<NodeInfo>,
    },
}

/// Index of the first bit where `other` differs from `ours`.
///
/// Bucket 0 holds peers differing in the top bit (farthest half of the
/// keyspace); bucket 255 the nearest sliver.
pub(crate) fn bucket_index(ours: &Address, other: &Address) -> usize {
    let dist = ours.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

#[derive(Debug)]
pub struct RoutingTable {
    our_info: NodeInfo,
    nodes: Vec<NodeInfo>,
}

impl RoutingTable {
    pub fn new(our_info: NodeInfo) -> Self {
        Self {
            our_info,
            nodes: Vec::new(),
        }
    }

    pub fn our_address(&self) -> Address {
        self.our_info.address
    }

    pub fn our_info(&self) -> &NodeInfo {
        &self.our_info
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.iter().any(|n| n.address == *address)
    }

    pub fn get(&self, address: &Address) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.address == *address)
    }

    /// Would `candidate` be accepted if offered? Never mutates.
    ///
    /// Accept if (i) not already present, not self, not the zero sentinel;
    /// and (ii) the table is not full, OR the candidate is strictly closer
    /// than the farthest member, OR the candidate's bucket is under
    /// [`BUCKET_TARGET`].
    pub fn check_node(&self, candidate: &Address) -> bool {
        if candidate.is_zero()
            || *candidate == self.our_info.address
            || self.contains(candidate)
        {
            return false;
        }
        if self.nodes.len() < MAX_TABLE {
            return true;
        }
        if let Some(farthest) = self.farthest() {
            if Address::closer_to(candidate, &farthest.address, &self.our_info.address) {
                return true;
            }
        }
        self.bucket_count(bucket_index(&self.our_info.address, candidate)) < BUCKET_TARGET
    }

    /// Offer a peer to the table.
    ///
    /// When the table is full, the eviction victim is the farthest member
    /// not protected by the unidirectional-interest rule: not in the close
    /// group, not the sole occupant of its bucket, and strictly farther
    /// than the candidate (unless the candidate fills an under-populated
    /// bucket). If every member is protected the candidate is rejected.
    pub fn add_node(&mut self, info: NodeInfo) -> (AddOutcome, Vec<TableChange>) {
        if !self.check_node(&info.address) {
            return (AddOutcome::default(), Vec::new());
        }

        let old_close = self.our_close_group();
        let mut events = Vec::new();
        let mut outcome = AddOutcome::default();

        if self.nodes.len() >= MAX_TABLE {
            let victim = match self.pick_eviction_victim(&info.address, &old_close) {
                Some(victim) => victim,
                None => {
                    debug!(
                        candidate = %&info.address.to_hex()[..16],
                        "table full and every member protected, candidate rejected"
                    );
                    return (AddOutcome::default(), Vec::new());
                }
            };
            let pos = self
                .nodes
                .iter()
                .position(|n| n.address == victim)
                .expect("victim chosen from current members");
            let evicted = self.nodes.remove(pos);
            events.push(TableChange::Removed(evicted.clone()));
            outcome.evicted = Some(evicted);
        }

        events.push(TableChange::Added(info.clone()));
        self.nodes.push(info);
        outcome.added = true;

        let new_close = self.our_close_group();
        if old_close != new_close {
            outcome.close_group_changed = true;
            events.push(TableChange::CloseGroupChanged {
                old: old_close,
                new: new_close,
            });
        }

        (outcome, events)
    }

    /// Remove a peer.
    ///
    /// `quorum_ok = true` means the caller has independent evidence the
    /// peer is gone (transport reported the connection closed, or a quorum
    /// voted it out). Without that evidence, close-group members are kept:
    /// the closest entries must survive anything short of proof of loss.
    pub fn drop_node(
        &mut self,
        address: &Address,
        quorum_ok: bool,
    ) -> (Option<NodeInfo>, Vec<TableChange>) {
        let pos = match self.nodes.iter().position(|n| n.address == *address) {
            Some(pos) => pos,
            None => return (None, Vec::new()),
        };

        let old_close = self.our_close_group();
        if !quorum_ok && old_close.iter().any(|n| n.address == *address) {
            debug!(
                peer = %&address.to_hex()[..16],
                "refusing unevidenced drop of close-group member"
            );
            return (None, Vec::new());
        }

        let removed = self.nodes.remove(pos);
        let mut events = vec![TableChange::Removed(removed.clone())];

        let new_close = self.our_close_group();
        if old_close != new_close {
            events.push(TableChange::CloseGroupChanged {
                old: old_close,
                new: new_close,
            });
        }

        (Some(removed), events)
    }

    /// Up to `n` known peers sorted ascending by XOR distance to `target`.
    ///
    /// With `include_self` the result may contain this node's own record.
    pub fn closest_nodes(&self, target: &Address, n: usize, include_self: bool) -> Vec<NodeInfo> {
        let mut result: Vec<NodeInfo> = self.nodes.clone();
        if include_self {
            result.push(self.our_info.clone());
        }
        sort_by_distance(&mut result, target);
        result.truncate(n);
        result
    }

    /// The single best next hop toward `target`.
    pub fn closest_to(&self, target: &Address) -> Option<NodeInfo> {
        self.nodes
            .iter()
            .min_by(|a, b| cmp_to_target(&a.address, &b.address, target))
            .cloned()
    }

    /// The [`CLOSE_SIZE`] entries closest to our own address.
    pub fn our_close_group(&self) -> Vec<NodeInfo> {
        self.closest_nodes(&self.our_info.address, CLOSE_SIZE, false)
    }

    /// Is `target` within this node's close-group range?
    ///
    /// True iff our own address is among the [`GROUP_SIZE`] closest to
    /// `target`, taking the union of ourselves and every table member.
    /// The test uses this node's local view only; eventual consistency
    /// across the overlay is acceptable.
    pub fn is_in_close_group(&self, target: &Address) -> bool {
        let group = self.closest_nodes(target, GROUP_SIZE, true);
        group.iter().any(|n| n.address == self.our_info.address)
    }

    fn farthest(&self) -> Option<&NodeInfo> {
        self.nodes
            .iter()
            .max_by(|a, b| cmp_to_target(&a.address, &b.address, &self.our_info.address))
    }

    fn bucket_count(&self, idx: usize) -> usize {
        self.nodes
            .iter()
            .filter(|n| bucket_index(&self.our_info.address, &n.address) == idx)
            .count()
    }

    fn pick_eviction_victim(
        &self,
        candidate: &Address,
        close_group: &[NodeInfo],
    ) -> Option<Address> {
        let ours = self.our_info.address;
        let candidate_fills_bucket =
            self.bucket_count(bucket_index(&ours, candidate)) < BUCKET_TARGET;

        let mut by_distance: Vec<&NodeInfo> = self.nodes.iter().collect();
        by_distance.sort_by(|a, b| cmp_to_target(&b.address, &a.address, &ours));

        for member in by_distance {
            if close_group.iter().any(|n| n.address == member.address) {
                continue;
            }
            if self.bucket_count(bucket_index(&ours, &member.address)) <= BUCKET_TARGET {
                continue;
            }
            if candidate_fills_bucket || Address::closer_to(candidate, &member.address, &ours) {
                return Some(member.address);
            }
        }
        None
    }
}

/// Ascending distance to `target`, ties broken by the lexicographically
/// smaller address. Distinct addresses can never actually tie under XOR,
/// but the total order keeps every sort deterministic.
fn cmp_to_target(a: &Address, b: &Address, target: &Address) -> std::cmp::Ordering {
    distance_cmp(&a.xor_distance(target), &b.xor_distance(target)).then_with(|| a.cmp(b))
}

fn sort_by_distance(nodes: &mut [NodeInfo], target: &Address) {
    nodes.sort_by(|a, b| cmp_to_target(&a.address, &b.address, target));
}
