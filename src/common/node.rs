//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::common::{Id, PeerRecord};

/// The age of a node's last_seen time before it is considered stale and removed from a full bucket
/// on inserting a new node.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);
const MIN_PING_BACKOFF_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq)]
/// Node entry in Kademlia routing table
pub struct Node(pub(crate) Arc<NodeInner>);

#[derive(PartialEq)]
pub(crate) struct NodeInner {
    pub(crate) id: Id,
    pub(crate) record: PeerRecord,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) last_seen: Instant,
}

impl Node {
    /// Creates a new Node from a verified [PeerRecord].
    pub fn new(record: PeerRecord) -> Node {
        Node(Arc::new(NodeInner {
            id: record.node_id(),
            address: record.udp_socket(),
            record,
            last_seen: Instant::now(),
        }))
    }

    /// Creates a node with a random signing key listening on a random local port.
    #[cfg(test)]
    pub fn random() -> Node {
        use rand::Rng;

        let port = rand::thread_rng().gen_range(1024..u16::MAX);
        let record = PeerRecord::builder(crate::common::record::random_signing_key())
            .address(SocketAddr::from(([127, 0, 0, 1], port)))
            .build()
            .expect("valid record");

        Node::new(record)
    }

    #[cfg(test)]
    pub(crate) fn with_last_seen(self, last_seen: Instant) -> Node {
        Node(Arc::new(NodeInner {
            id: self.0.id,
            record: self.0.record.clone(),
            address: self.0.address,
            last_seen,
        }))
    }

    // === Getters ===

    /// Returns the id of this node
    pub fn id(&self) -> &Id {
        &self.0.id
    }

    /// Returns the signed record of this node
    pub fn record(&self) -> &PeerRecord {
        &self.0.record
    }

    /// Returns the UDP endpoint advertised by this node's record, if any.
    pub fn address(&self) -> Option<SocketAddr> {
        self.0.address
    }

    pub fn seq(&self) -> u64 {
        self.0.record.seq()
    }

    pub fn last_seen(&self) -> Instant {
        self.0.last_seen
    }

    // === Public Methods ===

    /// Node is last seen more than a threshold ago.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    /// Node's last_seen is older than the ping backoff interval.
    pub(crate) fn should_ping(&self) -> bool {
        self.should_ping_at(Instant::now())
    }

    pub(crate) fn is_stale_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.0.last_seen) > STALE_TIME
    }

    pub(crate) fn should_ping_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.0.last_seen) > MIN_PING_BACKOFF_INTERVAL
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("address", &self.0.address)
            .field("seq", &self.0.record.seq())
            .field("last_seen", &self.0.last_seen.elapsed().as_secs())
            .finish()
    }
}

impl From<PeerRecord> for Node {
    fn from(record: PeerRecord) -> Node {
        Node::new(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_not_stale() {
        let node = Node::random();

        assert!(!node.is_stale());
        assert!(!node.should_ping());
        assert_eq!(node.id(), &node.record().node_id());
        assert!(node.address().is_some());
    }

    #[test]
    fn old_node_is_stale() {
        let now = Instant::now();
        let Some(long_ago) = now.checked_sub(STALE_TIME + Duration::from_secs(1)) else {
            // Instant too close to its epoch on this platform.
            return;
        };

        let node = Node::random().with_last_seen(long_ago);

        assert!(node.is_stale());
        assert!(node.should_ping());
    }
}
