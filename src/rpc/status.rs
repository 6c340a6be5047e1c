//! Connectivity status per address family.

use tracing::info;

use crate::common::RoutingTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Connectivity of this node for one address family.
pub enum NodeStatus {
    /// No usable node known.
    Disconnected,
    /// Bootstrapping, or only unverified nodes known.
    Connecting,
    /// Bootstrap completed and at least one good node is known.
    Connected,
}

/// Tracks the (IPv4, IPv6) status pair and reports changes exactly once.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    current: (NodeStatus, NodeStatus),
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            current: (NodeStatus::Disconnected, NodeStatus::Disconnected),
        }
    }

    pub fn current(&self) -> (NodeStatus, NodeStatus) {
        self.current
    }

    /// Recompute the status, returns the new pair if it changed.
    ///
    /// `bootstrapping` is the family of the in-progress bootstrap, if any.
    pub fn update(
        &mut self,
        routing_table: &RoutingTable,
        bootstrapped: bool,
        bootstrapping: Option<bool>,
    ) -> Option<(NodeStatus, NodeStatus)> {
        let next = (
            status(routing_table, true, bootstrapped, bootstrapping == Some(true)),
            status(routing_table, false, bootstrapped, bootstrapping == Some(false)),
        );

        if next == self.current {
            return None;
        }

        info!(ipv4 = ?next.0, ipv6 = ?next.1, "Connectivity status changed");

        self.current = next;
        Some(next)
    }
}

fn status(
    routing_table: &RoutingTable,
    ipv4: bool,
    bootstrapped: bool,
    bootstrapping: bool,
) -> NodeStatus {
    if bootstrapped && routing_table.has_good_node(ipv4) {
        return NodeStatus::Connected;
    }

    if bootstrapping
        || routing_table
            .nodes()
            .any(|node| node.is_ipv4() == ipv4 && !node.is_bad())
    {
        return NodeStatus::Connecting;
    }

    NodeStatus::Disconnected
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use crate::common::{Id, Node};

    use super::*;

    #[test]
    fn transitions_are_reported_once() {
        let mut tracker = StatusTracker::new();
        let mut routing_table = RoutingTable::new(Id::random());

        assert_eq!(tracker.update(&routing_table, false, None), None);

        assert_eq!(
            tracker.update(&routing_table, false, Some(true)),
            Some((NodeStatus::Connecting, NodeStatus::Disconnected))
        );
        assert_eq!(tracker.update(&routing_table, false, Some(true)), None);

        let id = Id::random();
        routing_table
            .add(Node::new(id, SocketAddr::from(([127, 0, 0, 1], 6881))))
            .unwrap();
        routing_table.mark_good(&id);

        // Good node but bootstrap still running.
        assert_eq!(tracker.update(&routing_table, false, Some(true)), None);

        assert_eq!(
            tracker.update(&routing_table, true, None),
            Some((NodeStatus::Connected, NodeStatus::Disconnected))
        );
        assert_eq!(tracker.update(&routing_table, true, None), None);

        routing_table.mark_bad(&id);

        assert_eq!(
            tracker.update(&routing_table, true, None),
            Some((NodeStatus::Disconnected, NodeStatus::Disconnected))
        );
    }

    #[test]
    fn families_are_independent() {
        let mut tracker = StatusTracker::new();
        let mut routing_table = RoutingTable::new(Id::random());

        let id = Id::random();
        routing_table
            .add(Node::new(id, "[::1]:6881".parse().unwrap()))
            .unwrap();

        assert_eq!(
            tracker.update(&routing_table, true, None),
            Some((NodeStatus::Disconnected, NodeStatus::Connecting))
        );

        routing_table.mark_good(&id);

        assert_eq!(
            tracker.update(&routing_table, true, None),
            Some((NodeStatus::Disconnected, NodeStatus::Connected))
        );
    }
}
