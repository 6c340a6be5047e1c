//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Liveness of a node as observed through our requests to it.
pub enum NodeState {
    /// Learned second hand (from another node's response or an incoming request).
    Unknown,
    /// Responded to our last request.
    Good,
    /// Failed to respond to at least one request since its last response.
    Questionable,
    /// Failed to respond to [crate::rpc::Config::failure_threshold] consecutive requests.
    Bad,
}

#[derive(Debug, Clone)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub(crate) id: Id,
    pub(crate) address: SocketAddr,
    pub(crate) token: Option<Box<[u8]>>,
    pub(crate) last_seen: Instant,
    pub(crate) state: NodeState,
    pub(crate) failed_requests: u8,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node {
            id,
            address,
            token: None,
            last_seen: Instant::now(),
            state: NodeState::Unknown,
            failed_requests: 0,
        }
    }

    /// Creates a node that just responded to one of our requests with a write token.
    pub(crate) fn new_with_token(id: Id, address: SocketAddr, token: Box<[u8]>) -> Node {
        Node {
            token: Some(token),
            state: NodeState::Good,
            ..Node::new(id, address)
        }
    }

    /// Creates a node that just responded to one of our requests.
    pub(crate) fn responding(id: Id, address: SocketAddr) -> Node {
        Node {
            state: NodeState::Good,
            ..Node::new(id, address)
        }
    }

    #[cfg(test)]
    pub(crate) fn random() -> Node {
        Node::new(
            Id::random(),
            SocketAddr::from(([127, 0, 0, 1], rand::random::<u16>().max(1))),
        )
    }

    #[cfg(test)]
    pub(crate) fn with_id(id: Id) -> Node {
        Node::new(id, SocketAddr::from(([127, 0, 0, 1], 6881)))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_good(&self) -> bool {
        self.state == NodeState::Good
    }

    pub fn is_bad(&self) -> bool {
        self.state == NodeState::Bad
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Node was never verified, is questionable, or is a good node we haven't heard from
    /// in `questionable_after`.
    pub(crate) fn should_ping(&self, now: Instant, questionable_after: Duration) -> bool {
        match self.state {
            NodeState::Unknown | NodeState::Questionable => true,
            NodeState::Good => now.saturating_duration_since(self.last_seen) >= questionable_after,
            NodeState::Bad => false,
        }
    }

    // === Private Methods ===

    /// Merge a fresher observation of the same node into this entry.
    pub(crate) fn refresh(&mut self, incoming: Node) {
        self.address = incoming.address;
        self.last_seen = incoming.last_seen.max(self.last_seen);

        if incoming.token.is_some() {
            self.token = incoming.token;
        }

        if incoming.state == NodeState::Good {
            self.mark_good();
        }
    }

    pub(crate) fn mark_good(&mut self) {
        self.state = NodeState::Good;
        self.failed_requests = 0;
        self.last_seen = Instant::now();
    }

    /// Count a failed request, returns the new state.
    pub(crate) fn record_failure(&mut self, threshold: u8) -> NodeState {
        self.failed_requests = self.failed_requests.saturating_add(1);

        self.state = if self.failed_requests >= threshold.max(1) {
            NodeState::Bad
        } else {
            NodeState::Questionable
        };

        self.state
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}
