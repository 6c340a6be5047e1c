use std::vec::IntoIter;

use crate::common::{compare_by_distance, Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by ascending XOR distance to a target, unique by [Id].
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_ok()
    }

    // === Public Methods ===

    /// Insert a node at its sorted position.
    ///
    /// If a node with the same id is already present, the most recently seen entry is kept.
    /// Returns the index of the node, or None if the older entry was kept.
    pub fn add(&mut self, node: Node) -> Option<usize> {
        match self.position(&node.id) {
            Ok(index) => {
                let existing = &mut self.nodes[index];

                if node.last_seen >= existing.last_seen {
                    let token = existing.token.take();
                    *existing = node;

                    if existing.token.is_none() {
                        existing.token = token;
                    }

                    Some(index)
                } else {
                    None
                }
            }
            Err(index) => {
                self.nodes.insert(index, node);
                Some(index)
            }
        }
    }

    /// Remove a node by id.
    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        self.position(id).ok().map(|index| self.nodes.remove(index))
    }

    /// The `count` closest nodes.
    pub fn take(&self, count: usize) -> &[Node] {
        &self.nodes[..count.min(self.nodes.len())]
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Result<usize, usize> {
        let target = self.target;

        self.nodes
            .binary_search_by(|node| compare_by_distance(&target, &node.id, id))
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_nodes = ClosestNodes::new(target);

        for _ in 0..10 {
            let node = Node::random();
            closest_nodes.add(node.clone());
            closest_nodes.add(node);
        }

        assert_eq!(closest_nodes.nodes().len(), 10);

        let distances = closest_nodes
            .nodes()
            .iter()
            .map(|n| n.id.xor(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn duplicate_keeps_most_recently_seen() {
        let target = Id::random();
        let mut closest_nodes = ClosestNodes::new(target);

        let id = Id::random();
        let mut old = Node::new(id, SocketAddr::from(([127, 0, 0, 1], 1000)));
        old.last_seen = Instant::now() - Duration::from_secs(60);
        let fresh = Node::new(id, SocketAddr::from(([127, 0, 0, 1], 2000)));

        closest_nodes.add(fresh.clone());
        assert!(closest_nodes.add(old).is_none());
        assert_eq!(closest_nodes.nodes()[0].address(), fresh.address());

        let newer = Node::new(id, SocketAddr::from(([127, 0, 0, 1], 3000)));
        closest_nodes.add(newer);

        assert_eq!(closest_nodes.len(), 1);
        assert_eq!(closest_nodes.nodes()[0].address().port(), 3000);
    }

    #[test]
    fn remove() {
        let mut closest_nodes = ClosestNodes::new(Id::random());
        let node = Node::random();

        closest_nodes.add(node.clone());
        assert!(closest_nodes.contains(node.id()));

        closest_nodes.remove(node.id());
        assert!(closest_nodes.is_empty());
    }
}
