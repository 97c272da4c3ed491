//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;
use std::sync::Arc;
use std::time::Instant;

use crate::common::{ClosestNodes, Id, Node, NodeInner, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 16;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u16, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] with a custom k-bucket size.
    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Maximum size of each k-bucket, and of [Self::closest] results.
    pub fn bucket_size(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Attempts to add a node to this routing table, and return `true` if it did.
    pub fn add(&mut self, node: Node) -> bool {
        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let k = self.k;
        let bucket = self
            .buckets
            .entry(distance)
            .or_insert_with(|| KBucket::new(k));

        bucket.add(node)
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id);

            if bucket.is_empty() {
                self.buckets.remove(&distance);
            }
        }
    }

    /// Refresh the `last_seen` of a known node, moving it to the tail of its bucket.
    pub fn mark_seen(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.mark_seen(node_id);
        }
    }

    /// Returns the node with this id, if known.
    pub fn get(&self, node_id: &Id) -> Option<Node> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)?
            .iter()
            .find(|node| node.id() == node_id)
            .cloned()
    }

    /// Return up to K nodes closest to the target, in ascending XOR distance.
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target);

        for bucket in self.buckets.values() {
            for node in bucket.iter() {
                closest.add(node.clone());
            }
        }

        closest.take(self.k).to_vec()
    }

    /// Returns all nodes at a given log2 distance from this node.
    pub fn nodes_at_distance(&self, distance: u16) -> Vec<Node> {
        if distance == 0 || distance > MAX_DISTANCE {
            return vec![];
        }

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Node> {
        self.nodes().cloned().collect()
    }

    // === Private Methods ===

    #[cfg(test)]
    fn contains(&self, node_id: &Id) -> bool {
        self.get(node_id).is_some()
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        KBucket {
            k,
            nodes: Vec::with_capacity(k),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Node) -> bool {
        if let Some(index) = self.iter().position(|n| n.id() == incoming.id()) {
            let existing = &self.nodes[index];

            // Records are signed, so a record with an equal or higher sequence
            // number is at least as authoritative as the one we hold, and
            // re-adding it also refreshes `last_seen`.
            if incoming.seq() >= existing.seq() {
                self.nodes.remove(index);
                self.nodes.push(incoming);

                true
            } else {
                false
            }
        } else if self.nodes.len() < self.k {
            self.nodes.push(incoming);
            true
        } else if self.nodes[0].is_stale() {
            // Remove the least recently seen node and add the new one
            self.nodes.remove(0);
            self.nodes.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id() != node_id);
    }

    pub fn mark_seen(&mut self, node_id: &Id) {
        if let Some(index) = self.iter().position(|n| n.id() == node_id) {
            let existing = self.nodes.remove(index);

            self.nodes.push(Node(Arc::new(NodeInner {
                id: existing.0.id,
                record: existing.0.record.clone(),
                address: existing.0.address,
                last_seen: Instant::now(),
            })));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::common::record::random_signing_key;
    use crate::common::PeerRecord;

    use super::*;

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.add(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn to_vec() {
        let mut table = RoutingTable::new(Id::random());

        let mut expected_nodes: Vec<Node> = vec![];

        for _ in 0..MAX_BUCKET_SIZE_K {
            expected_nodes.push(Node::random());
        }

        for node in &expected_nodes {
            table.add(node.clone());
        }

        let mut sorted_table = table.to_owned_nodes();
        sorted_table.sort_by(|a, b| a.id().cmp(b.id()));

        let mut sorted_expected = expected_nodes.to_vec();
        sorted_expected.sort_by(|a, b| a.id().cmp(b.id()));

        assert_eq!(sorted_table, sorted_expected);
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();

        assert!(!table.contains(node.id()));

        table.add(node.clone());
        assert!(table.contains(node.id()));
        assert_eq!(table.get(node.id()), Some(node.clone()));

        table.remove(node.id());
        assert!(!table.contains(node.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();

        table.add(node.clone());
        table.add(node);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let signer = random_signing_key();
        let record = PeerRecord::builder(signer).udp(1).build().unwrap();

        let mut table = RoutingTable::new(record.node_id());

        assert!(!table.add(Node::new(record)));
        assert!(table.is_empty())
    }

    #[test]
    fn should_not_add_more_than_k() {
        let mut bucket = KBucket::new(MAX_BUCKET_SIZE_K);

        for i in 0..MAX_BUCKET_SIZE_K {
            let node = Node::random();
            assert!(bucket.add(node), "Failed to add node {i}");
        }

        let node = Node::random();

        assert!(!bucket.add(node));
    }

    #[test]
    fn stale_node_is_evicted_from_full_bucket() {
        let Some(long_ago) = Instant::now().checked_sub(Duration::from_secs(60 * 60)) else {
            return;
        };

        let mut bucket = KBucket::new(2);

        let stale = Node::random().with_last_seen(long_ago);
        bucket.add(stale.clone());
        bucket.add(Node::random());

        let incoming = Node::random();
        assert!(bucket.add(incoming.clone()));

        assert!(!bucket.iter().any(|n| n.id() == stale.id()));
        assert!(bucket.iter().any(|n| n.id() == incoming.id()));
    }

    #[test]
    fn should_replace_only_with_newer_or_equal_seq() {
        let signer = random_signing_key();

        let old = Node::new(
            PeerRecord::builder(signer.clone())
                .seq(2)
                .address("127.0.0.1:1000".parse().unwrap())
                .build()
                .unwrap(),
        );
        let older = Node::new(
            PeerRecord::builder(signer.clone())
                .seq(1)
                .address("127.0.0.1:1001".parse().unwrap())
                .build()
                .unwrap(),
        );
        let newer = Node::new(
            PeerRecord::builder(signer)
                .seq(3)
                .address("127.0.0.1:1002".parse().unwrap())
                .build()
                .unwrap(),
        );

        let mut bucket = KBucket::new(MAX_BUCKET_SIZE_K);
        bucket.add(old.clone());
        bucket.add(Node::random());

        assert!(!bucket.add(older));
        assert_eq!(bucket.nodes[0].seq(), 2);

        assert!(bucket.add(newer.clone()));
        assert_eq!(bucket.nodes.len(), 2);
        assert_eq!(bucket.nodes[1].address(), newer.address());
    }

    #[test]
    fn mark_seen_moves_node_to_tail() {
        let mut bucket = KBucket::new(MAX_BUCKET_SIZE_K);
        let first = Node::random();

        bucket.add(first.clone());
        bucket.add(Node::random());

        bucket.mark_seen(first.id());

        assert_eq!(bucket.nodes[1].id(), first.id());
    }

    #[test]
    fn closest() {
        let local_id = Id::random();
        let mut table = RoutingTable::with_bucket_size(local_id, 200);

        let nodes = (0..100).map(|_| Node::random()).collect::<Vec<_>>();
        for node in &nodes {
            table.add(node.clone());
        }

        let target = Id::random();
        let mut table = RoutingTable {
            k: MAX_BUCKET_SIZE_K,
            ..table
        };
        let closest = table.closest(&target);

        let mut expected = nodes.clone();
        expected.sort_by_key(|n| n.id().xor(&target));
        expected.truncate(MAX_BUCKET_SIZE_K);

        assert_eq!(closest, expected);

        table.remove(closest[0].id());
        assert_eq!(table.closest(&target)[0], expected[1]);
    }

    #[test]
    fn nodes_at_distance() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();
        let distance = table.id().distance(node.id());
        table.add(node.clone());

        assert_eq!(table.nodes_at_distance(distance), vec![node]);
        assert!(table.nodes_at_distance(0).is_empty());
        assert!(table.nodes_at_distance(MAX_DISTANCE + 1).is_empty());
    }
}
