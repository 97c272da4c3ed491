//! One independent lane of a disjoint-path lookup.

use std::collections::{HashMap, HashSet};

use flume::Sender;
use tracing::{debug, trace};

use crate::common::{ClosestNodes, Id, Node};

/// A FindNode request a lane wants sent.
#[derive(Debug, Clone)]
pub struct FindNodeQuery {
    pub lane: usize,
    pub node: Node,
    pub vary_distance: bool,
}

#[derive(Debug)]
pub(crate) struct PathBucket {
    index: usize,
    target: Id,
    k: usize,
    alpha: usize,

    /// Every node registered in this lane.
    nodes: HashMap<Id, Node>,
    /// Contacted peer -> reported neighbours not yet queried.
    responses: HashMap<Id, ClosestNodes>,
    /// Contacted peer -> outstanding `Nodes` chunks, 0 when none are expected.
    expected_responses: HashMap<Id, u8>,
    /// Peers that answered, never more than K.
    queried: HashSet<Id>,
    /// Peers a FindNode was sent to.
    contacted: HashSet<Id>,
    /// Peers that got their one vary distance retry.
    varied: HashSet<Id>,
    discovered: ClosestNodes,

    complete: bool,
    completion: Sender<()>,
}

impl PathBucket {
    pub fn new(
        index: usize,
        target: Id,
        k: usize,
        alpha: usize,
        peers: Vec<Node>,
        completion: Sender<()>,
    ) -> Self {
        let mut bucket = Self {
            index,
            target,
            k,
            alpha,
            nodes: HashMap::new(),
            responses: HashMap::new(),
            expected_responses: HashMap::new(),
            queried: HashSet::new(),
            contacted: HashSet::new(),
            varied: HashSet::new(),
            discovered: ClosestNodes::new(target),
            complete: false,
            completion,
        };

        for peer in peers {
            bucket.register(peer);
        }

        bucket
    }

    // === Getters ===

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.responses.contains_key(id)
    }

    pub fn discovered(&self) -> &ClosestNodes {
        &self.discovered
    }

    pub fn queried_count(&self) -> usize {
        self.queried.len()
    }

    pub fn registered(&self) -> impl Iterator<Item = &Id> {
        self.responses.keys()
    }

    // === Public Methods ===

    /// Query every registered peer that has no outstanding chunks and was never contacted.
    pub fn dispatch(&mut self) -> Vec<FindNodeQuery> {
        let candidates = self
            .responses
            .keys()
            .filter(|id| self.expected_responses.get(id).copied().unwrap_or(0) == 0)
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect::<Vec<_>>();

        candidates
            .into_iter()
            .filter_map(|node| self.query(node, false))
            .collect()
    }

    /// Handle one `Nodes` chunk from `sender`, returning follow up queries.
    pub fn handle_nodes(&mut self, sender: &Id, total: u8, neighbours: &[Node]) -> Vec<FindNodeQuery> {
        if !self.contains(sender) || self.complete {
            return vec![];
        }

        let counter = self.expected_responses.entry(*sender).or_insert(0);
        *counter = if *counter == 0 {
            total.saturating_sub(1)
        } else {
            *counter - 1
        };
        let outstanding = *counter;

        if self.queried.len() < self.k {
            self.queried.insert(*sender);
        }

        let mut queries = vec![];

        if neighbours.is_empty() {
            if outstanding == 0 && self.varied.insert(*sender) {
                if let Some(node) = self.nodes.get(sender).cloned() {
                    trace!(lane = self.index, ?sender, "Empty response, retrying with vary distance");

                    queries.push(FindNodeQuery {
                        lane: self.index,
                        node,
                        vary_distance: true,
                    });
                }
            }
        } else {
            for node in neighbours {
                self.discovered.add(node.clone());

                if self.queried.contains(node.id()) || self.contacted.contains(node.id()) {
                    continue;
                }

                self.nodes.entry(*node.id()).or_insert_with(|| node.clone());

                if let Some(frontier) = self.responses.get_mut(sender) {
                    frontier.add(node.clone());
                }
            }

            if outstanding == 0 {
                queries.extend(self.query_frontier(sender));
            }
        }

        if self.queried.len() >= self.k {
            self.mark_complete();
        }

        queries
    }

    // === Private Methods ===

    /// Query the closest α of `responses[sender]` that are not queried yet.
    fn query_frontier(&mut self, sender: &Id) -> Vec<FindNodeQuery> {
        let frontier = match self.responses.get(sender) {
            Some(frontier) => frontier
                .iter()
                .filter(|node| {
                    !self.queried.contains(node.id()) && !self.contacted.contains(node.id())
                })
                .take(self.alpha)
                .cloned()
                .collect::<Vec<_>>(),
            None => return vec![],
        };

        frontier
            .into_iter()
            .filter_map(|node| {
                self.register(node.clone());
                self.query(node, false)
            })
            .collect()
    }

    fn register(&mut self, node: Node) {
        let id = *node.id();

        self.responses
            .entry(id)
            .or_insert_with(|| ClosestNodes::new(self.target));
        self.expected_responses.entry(id).or_insert(0);
        self.nodes.entry(id).or_insert(node);
    }

    fn query(&mut self, node: Node, vary_distance: bool) -> Option<FindNodeQuery> {
        if self.queried.len() >= self.k {
            return None;
        }

        if !self.contacted.insert(*node.id()) {
            return None;
        }

        if node.address().is_none() {
            debug!(lane = self.index, id = ?node.id(), "Skipping node without an address");
            return None;
        }

        Some(FindNodeQuery {
            lane: self.index,
            node,
            vary_distance,
        })
    }

    fn mark_complete(&mut self) {
        if !self.complete {
            self.complete = true;

            trace!(
                lane = self.index,
                queried = self.queried.len(),
                discovered = self.discovered.len(),
                "Lane complete"
            );

            let _ = self.completion.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(k: usize, peers: Vec<Node>) -> (PathBucket, flume::Receiver<()>) {
        let (sender, receiver) = flume::bounded(1);

        (PathBucket::new(0, Id::random(), k, 3, peers, sender), receiver)
    }

    #[test]
    fn dispatch_registered_peers_once() {
        let peers = vec![Node::random(), Node::random()];
        let (mut lane, _) = lane(16, peers.clone());

        let queries = lane.dispatch();
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| !q.vary_distance));

        assert!(lane.dispatch().is_empty());
    }

    #[test]
    fn empty_response_requeries_once_with_vary_distance() {
        let peer = Node::random();
        let (mut lane, _) = lane(16, vec![peer.clone()]);
        lane.dispatch();

        let queries = lane.handle_nodes(peer.id(), 1, &[]);

        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].node.id(), peer.id());
        assert!(queries[0].vary_distance);

        // Frontier did not advance, and no second retry.
        assert!(lane.handle_nodes(peer.id(), 1, &[]).is_empty());
        assert!(lane.discovered().is_empty());
    }

    #[test]
    fn response_queries_closest_alpha() {
        let peer = Node::random();
        let (mut lane, _) = lane(16, vec![peer.clone()]);
        lane.dispatch();

        let neighbours = (0..5).map(|_| Node::random()).collect::<Vec<_>>();
        let queries = lane.handle_nodes(peer.id(), 1, &neighbours);

        assert_eq!(queries.len(), 3);
        assert_eq!(lane.discovered().len(), 5);

        let mut closest = ClosestNodes::new(lane.target);
        closest.extend(neighbours.iter().cloned());

        let expected = closest.take(3).iter().map(|n| *n.id()).collect::<Vec<_>>();
        let queried = queries.iter().map(|q| *q.node.id()).collect::<Vec<_>>();
        assert_eq!(queried, expected);

        // Neighbours are registered, their responses are handled by this lane.
        for id in &queried {
            assert!(lane.contains(id));
        }
    }

    #[test]
    fn chunked_response_waits_for_last_chunk() {
        let peer = Node::random();
        let (mut lane, _) = lane(16, vec![peer.clone()]);
        lane.dispatch();

        let first = (0..2).map(|_| Node::random()).collect::<Vec<_>>();
        let second = (0..2).map(|_| Node::random()).collect::<Vec<_>>();

        assert!(lane.handle_nodes(peer.id(), 2, &first).is_empty());
        assert_eq!(lane.expected_responses[peer.id()], 1);

        let queries = lane.handle_nodes(peer.id(), 2, &second);
        assert_eq!(lane.expected_responses[peer.id()], 0);
        assert_eq!(queries.len(), 3);
        assert_eq!(lane.discovered().len(), 4);
    }

    #[test]
    fn completion_is_monotonic() {
        let peers = (0..3).map(|_| Node::random()).collect::<Vec<_>>();
        let (mut lane, receiver) = lane(2, peers.clone());
        lane.dispatch();

        lane.handle_nodes(peers[0].id(), 1, &[Node::random()]);
        assert!(!lane.is_complete());

        lane.handle_nodes(peers[1].id(), 1, &[Node::random()]);
        assert!(lane.is_complete());
        assert!(receiver.try_recv().is_ok());

        assert_eq!(lane.queried_count(), 2);

        // Nothing clears the flag, and queried never exceeds K.
        assert!(lane
            .handle_nodes(peers[2].id(), 1, &[Node::random()])
            .is_empty());
        assert!(lane.dispatch().is_empty());
        assert!(lane.is_complete());
        assert_eq!(lane.queried_count(), 2);
    }

    #[test]
    fn ignore_unknown_sender() {
        let (mut lane, _) = lane(16, vec![Node::random()]);

        assert!(lane
            .handle_nodes(&Id::random(), 1, &[Node::random()])
            .is_empty());
        assert!(lane.discovered().is_empty());
    }
}
