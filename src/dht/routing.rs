//! DHT routing table module
//!
//! Kademlia-style table bounded per bucket and in total. Bad nodes are the
//! only ones ever displaced; a node id appears at most once.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::node::{NodeId, NodeSession, NodeStatus};

/// Result of offering a node to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Already present at the same address; contact time updated
    Refreshed,
    /// Took the slot of a bad node
    Replaced(NodeId),
    /// Full, own id, or the id is already bound to another address
    Rejected,
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    nodes: Vec<NodeSession>,
    last_changed: Instant,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            last_changed: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == *id)
    }

    fn touch(&mut self) {
        self.last_changed = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<KBucket>,
    bucket_size: usize,
    capacity: usize,
    len: usize,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, capacity: usize, bucket_size: usize) -> Self {
        Self {
            our_id,
            buckets: (0..160).map(|_| KBucket::new(bucket_size)).collect(),
            bucket_size,
            capacity,
            len: 0,
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.our_id.common_prefix_len(id).min(159)
    }

    /// Offer a node to the table
    pub fn insert(&mut self, node: NodeSession) -> InsertOutcome {
        if node.id == self.our_id {
            return InsertOutcome::Rejected;
        }
        let index = self.bucket_index(&node.id);
        let table_full = self.len >= self.capacity;
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position(&node.id) {
            let existing = &mut bucket.nodes[pos];
            if existing.addr != node.addr {
                debug!(
                    "Rejecting node {} at {}: id already bound to {}",
                    node.id, node.addr, existing.addr
                );
                return InsertOutcome::Rejected;
            }
            if node.status == NodeStatus::Good {
                existing.mark_responded();
            }
            bucket.touch();
            return InsertOutcome::Refreshed;
        }

        if bucket.len() < bucket_size && !table_full {
            trace!("Adding node {} at {} to bucket {}", node.id, node.addr, index);
            bucket.nodes.push(node);
            bucket.touch();
            self.len += 1;
            return InsertOutcome::Added;
        }

        if let Some(pos) = bucket.nodes.iter().position(NodeSession::is_bad) {
            let evicted = std::mem::replace(&mut bucket.nodes[pos], node);
            bucket.touch();
            debug!("Replaced bad node {} in bucket {}", evicted.id, index);
            return InsertOutcome::Replaced(evicted.id);
        }

        if bucket.len() < bucket_size {
            // Table is full but this bucket has room: displace a bad node elsewhere
            let victim = self
                .buckets
                .iter()
                .flat_map(|b| b.nodes.iter())
                .find(|n| n.is_bad())
                .map(|n| n.id);
            if let Some(victim) = victim {
                self.remove(&victim);
                let bucket = &mut self.buckets[index];
                bucket.nodes.push(node);
                bucket.touch();
                self.len += 1;
                debug!("Replaced bad node {} to make room in bucket {}", victim, index);
                return InsertOutcome::Replaced(victim);
            }
        }
        trace!("Routing table has no room for {}", node.id);
        InsertOutcome::Rejected
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeSession> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.position(id).map(|pos| bucket.nodes[pos].clone())
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeSession> {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(id)?;
        bucket.touch();
        self.len -= 1;
        Some(bucket.nodes.remove(pos))
    }

    fn with_node(&mut self, id: &NodeId, f: impl FnOnce(&mut NodeSession)) -> bool {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        match bucket.position(id) {
            Some(pos) => {
                f(&mut bucket.nodes[pos]);
                true
            }
            None => false,
        }
    }

    pub fn mark_responded(&mut self, id: &NodeId) -> bool {
        self.with_node(id, NodeSession::mark_responded)
    }

    pub fn mark_failed(&mut self, id: &NodeId) -> bool {
        self.with_node(id, NodeSession::mark_failed)
    }

    /// Record a missed reply from whichever node lives at `addr`
    pub fn mark_failed_at(&mut self, addr: &SocketAddr) -> bool {
        match self
            .buckets
            .iter_mut()
            .flat_map(|b| b.nodes.iter_mut())
            .find(|n| n.addr == *addr)
        {
            Some(node) => {
                node.mark_failed();
                true
            }
            None => false,
        }
    }

    /// Up to `count` usable nodes closest to `target`
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeSession> {
        let mut nodes: Vec<NodeSession> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_bad())
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    /// Copy of every node
    pub fn snapshot(&self) -> Vec<NodeSession> {
        self.buckets.iter().flat_map(|b| b.nodes.iter().cloned()).collect()
    }

    /// Demote good nodes quiet for `quiet`; returns how many changed
    pub fn decay(&mut self, quiet: Duration) -> usize {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.nodes.iter_mut())
            .filter_map(|n| n.decay(quiet).then_some(()))
            .count()
    }

    /// Nodes that should be re-pinged
    pub fn questionable(&self) -> Vec<NodeSession> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| matches!(n.status, NodeStatus::Questionable | NodeStatus::Unknown))
            .cloned()
            .collect()
    }

    /// Drop bad nodes; returns how many were removed
    pub fn prune(&mut self) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.nodes.len();
            bucket.nodes.retain(|n| !n.is_bad());
            removed += before - bucket.nodes.len();
        }
        self.len -= removed;
        if removed > 0 {
            debug!("Pruned {} bad nodes, {} remain", removed, self.len);
        }
        removed
    }

    /// Non-empty buckets untouched for `timeout`
    pub fn stale_buckets(&self, timeout: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_changed.elapsed() > timeout)
            .map(|(i, _)| i)
            .collect()
    }

    /// Random id falling into bucket `index`
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut id = NodeId::random().0;
        let index = index.min(159);
        for bit in 0..=index {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let ours = self.our_id.0[byte] & mask;
            let value = if bit == index { ours ^ mask } else { ours };
            id[byte] = (id[byte] & !mask) | value;
        }
        NodeId(id)
    }
}
