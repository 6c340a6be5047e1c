use std::net::SocketAddr;

use crate::Id;

use super::{NodeStatus, Rpc};

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    routing_table_size: usize,
    status: (NodeStatus, NodeStatus),
    stored_values: usize,
    bootstrapped: bool,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Connectivity status for IPv4 and IPv6.
    pub fn status(&self) -> (NodeStatus, NodeStatus) {
        self.status
    }
    /// Number of values held in the value store.
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
    /// Returns `true` once a bootstrap lookup found at least one node,
    /// or if this node had nothing to bootstrap from.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            status: rpc.status(),
            stored_values: rpc.store().len(),
            bootstrapped: rpc.bootstrapped(),
        }
    }
}
