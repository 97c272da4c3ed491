//! Disjoint-path iterative lookup toward a target id.

use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, trace};

use crate::common::{ClosestNodes, Id, Node, PeerRecord, MAX_BUCKET_SIZE_K};

use super::path_bucket::{FindNodeQuery, PathBucket};

pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_LOOKUP_PARALLELISM: usize = 2;
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct LookupParams {
    /// Peers queried concurrently from each response frontier.
    pub alpha: usize,
    /// Maximum number of independent lanes.
    pub parallelism: usize,
    /// Queried peers per lane before it completes, and size of the result.
    pub k: usize,
    /// Shared deadline of every lane.
    pub timeout: Duration,
}

impl Default for LookupParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            parallelism: DEFAULT_LOOKUP_PARALLELISM,
            k: MAX_BUCKET_SIZE_K,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Result of a finished lookup.
pub struct LookupOutcome {
    /// Up to K records, closest to the target first.
    pub records: Vec<PeerRecord>,
    pub completed_lanes: usize,
    pub timed_out_lanes: usize,
}

#[derive(Debug)]
/// All the lanes of one lookup.
pub struct Lookup {
    local_id: Id,
    target: Id,
    k: usize,
    lanes: Vec<PathBucket>,
    started_at: Instant,
    timeout: Duration,
}

impl Lookup {
    /// Partition the `closest` known peers into lanes and return the first queries to send,
    /// along with one completion receiver per lane.
    pub fn start(
        local_id: Id,
        target: Id,
        closest: Vec<Node>,
        params: LookupParams,
    ) -> (Self, Vec<FindNodeQuery>, Vec<Receiver<()>>) {
        let initial = closest
            .into_iter()
            .filter(|node| *node.id() != local_id)
            .take(params.alpha)
            .collect::<Vec<_>>();

        let lanes_count = initial.len().min(params.parallelism);

        let mut partitions: Vec<Vec<Node>> = vec![vec![]; lanes_count];
        for (i, node) in initial.into_iter().enumerate() {
            partitions[i % lanes_count].push(node);
        }

        let mut receivers = Vec::with_capacity(lanes_count);
        let mut lanes = Vec::with_capacity(lanes_count);

        for (index, peers) in partitions.into_iter().enumerate() {
            let (sender, receiver) = flume::bounded(1);

            receivers.push(receiver);
            lanes.push(PathBucket::new(
                index,
                target,
                params.k,
                params.alpha,
                peers,
                sender,
            ));
        }

        let queries = lanes
            .iter_mut()
            .flat_map(|lane| lane.dispatch())
            .collect::<Vec<_>>();

        trace!(?target, lanes = lanes_count, queries = queries.len(), "New Lookup");

        (
            Self {
                local_id,
                target,
                k: params.k,
                lanes,
                started_at: Instant::now(),
                timeout: params.timeout,
            },
            queries,
            receivers,
        )
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    pub fn is_complete(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_complete())
    }

    /// Neither expired nor finished in every lane.
    pub fn is_in_progress(&self) -> bool {
        !self.is_expired() && !self.is_complete()
    }

    /// Whether any lane registered this peer.
    pub fn involves(&self, id: &Id) -> bool {
        self.lanes.iter().any(|lane| lane.contains(id))
    }

    // === Public Methods ===

    /// Feed one `Nodes` chunk from `sender` to every lane that contacted it.
    pub fn handle_nodes(
        &mut self,
        sender: &Id,
        total: u8,
        records: &[PeerRecord],
    ) -> Vec<FindNodeQuery> {
        let neighbours = records
            .iter()
            .filter(|record| record.node_id() != self.local_id)
            .cloned()
            .map(Node::new)
            .collect::<Vec<_>>();

        self.lanes
            .iter_mut()
            .filter(|lane| lane.contains(sender))
            .flat_map(|lane| lane.handle_nodes(sender, total, &neighbours))
            .collect()
    }

    /// Merge the completed lanes, dropping the ones that did not complete.
    pub fn finish(self) -> LookupOutcome {
        let mut merged = ClosestNodes::new(self.target);
        let mut completed_lanes = 0;

        for lane in &self.lanes {
            if lane.is_complete() {
                completed_lanes += 1;
                merged.extend(lane.discovered().iter().cloned());
            } else {
                debug!(
                    target = ?self.target,
                    lane = lane.index(),
                    queried = lane.queried_count(),
                    "Lane timed out"
                );
            }
        }

        merged.truncate(self.k);

        let outcome = LookupOutcome {
            records: merged
                .into_iter()
                .map(|node| node.record().clone())
                .collect(),
            completed_lanes,
            timed_out_lanes: self.lanes.len() - completed_lanes,
        };

        debug!(
            target = ?self.target,
            found = outcome.records.len(),
            completed = outcome.completed_lanes,
            timed_out = outcome.timed_out_lanes,
            "Lookup done"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn params(k: usize) -> LookupParams {
        LookupParams {
            k,
            ..Default::default()
        }
    }

    #[test]
    fn round_robin_partition() {
        let local = Id::random();
        let target = Id::random();
        let peers = (0..3).map(|_| Node::random()).collect::<Vec<_>>();

        let (lookup, queries, receivers) = Lookup::start(local, target, peers.clone(), params(16));

        assert_eq!(lookup.lanes(), 2);
        assert_eq!(receivers.len(), 2);
        assert_eq!(queries.len(), 3);

        let lane_of = |id: &Id| queries.iter().find(|q| q.node.id() == id).map(|q| q.lane);

        assert_eq!(lane_of(peers[0].id()), Some(0));
        assert_eq!(lane_of(peers[1].id()), Some(1));
        assert_eq!(lane_of(peers[2].id()), Some(0));
    }

    #[test]
    fn lane_count_bounded_by_initial_peers() {
        let (lookup, queries, _) =
            Lookup::start(Id::random(), Id::random(), vec![Node::random()], params(16));

        assert_eq!(lookup.lanes(), 1);
        assert_eq!(queries.len(), 1);
    }

    #[test]
    fn only_alpha_initial_peers() {
        let peers = (0..10).map(|_| Node::random()).collect::<Vec<_>>();

        let (_, queries, _) = Lookup::start(Id::random(), Id::random(), peers, params(16));

        assert_eq!(queries.len(), DEFAULT_ALPHA);
    }

    #[test]
    fn empty_table_finishes_immediately() {
        let (lookup, queries, receivers) =
            Lookup::start(Id::random(), Id::random(), vec![], params(16));

        assert!(queries.is_empty());
        assert!(receivers.is_empty());
        assert!(lookup.is_complete());
        assert!(!lookup.is_in_progress());

        let outcome = lookup.finish();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.completed_lanes, 0);
        assert_eq!(outcome.timed_out_lanes, 0);
    }

    #[test]
    fn self_is_never_a_neighbour() {
        let local = Node::random();
        let peer = Node::random();

        let (mut lookup, _, _) =
            Lookup::start(*local.id(), Id::random(), vec![peer.clone()], params(16));

        let queries = lookup.handle_nodes(peer.id(), 1, &[local.record().clone()]);

        assert!(queries.is_empty());
        assert!(!lookup.involves(local.id()));
    }

    #[test]
    fn result_is_sorted_deduplicated_and_bounded() {
        let k = 2;
        let target = Id::random();
        let peers = (0..2).map(|_| Node::random()).collect::<Vec<_>>();

        let (mut lookup, _, receivers) = Lookup::start(Id::random(), target, peers.clone(), params(k));
        assert_eq!(lookup.lanes(), 2);

        // Both lanes hear about overlapping neighbours.
        let shared = (0..4).map(|_| Node::random()).collect::<Vec<_>>();
        let records = shared.iter().map(|n| n.record().clone()).collect::<Vec<_>>();

        for peer in &peers {
            let queries = lookup.handle_nodes(peer.id(), 1, &records);

            // Each lane answers for the neighbours it queried.
            for query in queries {
                lookup.handle_nodes(query.node.id(), 1, &records);
            }
        }

        assert!(lookup.is_complete());
        for receiver in &receivers {
            assert!(receiver.try_recv().is_ok());
        }

        let outcome = lookup.finish();
        assert_eq!(outcome.completed_lanes, 2);
        assert_eq!(outcome.timed_out_lanes, 0);
        assert_eq!(outcome.records.len(), k);

        let ids = outcome
            .records
            .iter()
            .map(|r| r.node_id())
            .collect::<Vec<_>>();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());

        for pair in ids.windows(2) {
            assert!(pair[0].xor(&target) <= pair[1].xor(&target));
        }
    }

    #[test]
    fn incomplete_lanes_are_excluded() {
        let target = Id::random();
        let peers = (0..2).map(|_| Node::random()).collect::<Vec<_>>();

        let (mut lookup, _, _) = Lookup::start(Id::random(), target, peers.clone(), params(1));

        let neighbour = Node::random();
        lookup.handle_nodes(peers[0].id(), 1, &[neighbour.record().clone()]);

        let outcome = lookup.finish();
        assert_eq!(outcome.completed_lanes, 1);
        assert_eq!(outcome.timed_out_lanes, 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(&outcome.records[0].node_id(), neighbour.id());
    }

    #[test]
    fn late_responses_are_absorbed() {
        let peer = Node::random();

        let (mut lookup, _, _) = Lookup::start(Id::random(), Id::random(), vec![peer], params(16));

        assert!(lookup
            .handle_nodes(&Id::random(), 1, &[Node::random().record().clone()])
            .is_empty());
    }
}
