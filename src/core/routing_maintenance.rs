//! Routing table maintenance logic.

use std::time::{Duration, Instant};

use crate::common::{Id, Node, RoutingTable};

pub const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    last_table_refresh: Instant,
    last_table_ping: Instant,
    refresh_interval: Duration,
    ping_interval: Duration,
}

/// Decisions about routing table maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Whether to look up our own id to refill the routing table
    pub should_refresh: bool,

    /// Node IDs to purge from the routing table
    pub nodes_to_purge: Vec<Id>,

    /// Nodes to ping, by record since a session needs the record to be established
    pub nodes_to_ping: Vec<Node>,
}

impl RoutingMaintenance {
    pub fn new(refresh_interval: Duration, ping_interval: Duration) -> Self {
        RoutingMaintenance {
            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
            refresh_interval,
            ping_interval,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Computes decisions and resets internal timers when intervals elapse.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &RoutingTable,
    ) -> MaintenanceDecisions {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table)
    }

    fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &RoutingTable,
    ) -> MaintenanceDecisions {
        let refresh_is_due = now.duration_since(self.last_table_refresh) >= self.refresh_interval;
        let ping_is_due = now.duration_since(self.last_table_ping) >= self.ping_interval;

        let (nodes_to_purge, nodes_to_ping) = if ping_is_due {
            self.last_table_ping = now;
            purge_and_ping_candidates(now, routing_table)
        } else {
            (Vec::new(), Vec::new())
        };

        // An empty table has nobody to ask.
        let should_refresh = refresh_is_due && !routing_table.is_empty();

        if refresh_is_due {
            self.last_table_refresh = now;
        }

        MaintenanceDecisions {
            should_refresh,
            nodes_to_purge,
            nodes_to_ping,
        }
    }
}

impl Default for RoutingMaintenance {
    fn default() -> Self {
        Self::new(REFRESH_TABLE_INTERVAL, PING_TABLE_INTERVAL)
    }
}

/// Stale nodes are purged, quiet ones pinged.
fn purge_and_ping_candidates(now: Instant, routing_table: &RoutingTable) -> (Vec<Id>, Vec<Node>) {
    let mut to_purge = Vec::with_capacity(routing_table.size());
    let mut to_ping = Vec::with_capacity(routing_table.size());

    for node in routing_table.nodes() {
        if node.is_stale_at(now) {
            to_purge.push(*node.id());
        } else if node.should_ping_at(now) {
            to_ping.push(node.clone());
        }
    }

    (to_purge, to_ping)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::common::{Id, Node, RoutingTable, STALE_TIME};

    use super::*;

    #[test]
    fn nothing_due_right_away() {
        let mut maintenance = RoutingMaintenance::default();
        let mut routing_table = RoutingTable::new(Id::random());
        routing_table.add(Node::random());

        let decisions = maintenance.periodic_maintenance_decisions(&routing_table);

        assert!(!decisions.should_refresh);
        assert!(decisions.nodes_to_ping.is_empty());
        assert!(decisions.nodes_to_purge.is_empty());
    }

    #[test]
    fn refresh_due_updates_refresh_timer() {
        let mut maintenance = RoutingMaintenance::default();
        let mut routing_table = RoutingTable::new(Id::random());
        routing_table.add(Node::random());

        let before = maintenance.last_table_refresh;

        // Add to Instant::now() instead of subtracting, Instant can be close to its epoch.
        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert!(decisions.should_refresh);
        assert!(maintenance.last_table_refresh > before);
        assert_eq!(maintenance.last_table_refresh, future);
    }

    #[test]
    fn empty_table_is_not_refreshed() {
        let mut maintenance = RoutingMaintenance::default();
        let routing_table = RoutingTable::new(Id::random());

        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert!(!decisions.should_refresh);
    }

    #[test]
    fn ping_quiet_nodes_and_purge_stale_ones() {
        let mut maintenance = RoutingMaintenance::default();
        let mut routing_table = RoutingTable::new(Id::random());

        let now = Instant::now();
        let future = now + STALE_TIME + Duration::from_secs(1);

        let stale = Node::random().with_last_seen(now);
        let quiet = Node::random().with_last_seen(now + Duration::from_secs(5 * 60));
        let fresh = Node::random().with_last_seen(future);

        routing_table.add(stale.clone());
        routing_table.add(quiet.clone());
        routing_table.add(fresh.clone());

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &routing_table);

        assert_eq!(decisions.nodes_to_purge, vec![*stale.id()]);
        assert_eq!(decisions.nodes_to_ping.len(), 1);
        assert_eq!(decisions.nodes_to_ping[0].id(), quiet.id());
    }
}
