//! Kademlia routing table with splitting buckets.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::{ClosestNodes, Id, Node, NodeState, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Consecutive failed requests before a node is considered [NodeState::Bad].
pub const DEFAULT_FAILURE_THRESHOLD: u8 = 3;

#[derive(Debug, Clone)]
/// Kademlia routing table
///
/// Buckets are sorted by the range they cover, never overlap, and together cover the
/// whole identifier space. Only the bucket covering our own id is ever split.
pub struct RoutingTable {
    id: Id,
    k: usize,
    failure_threshold: u8,
    buckets: Vec<KBucket>,
}

#[derive(Debug, Clone, PartialEq)]
/// Successful outcome of [RoutingTable::add].
pub enum InsertOutcome {
    /// The node was not known and was added.
    Inserted,
    /// The node was already known, its entry was refreshed.
    Updated,
    /// The bucket was full, this bad node was evicted to make room.
    Replaced(Node),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors adding a node to the [RoutingTable].
pub enum InsertError {
    /// The bucket covering this node is full of live nodes, and can't be split.
    #[error("Bucket full, no insertion")]
    BucketFull,

    /// Nodes never store themselves.
    #[error("Can not add the local node to its own routing table")]
    LocalId,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: MAX_BUCKET_SIZE_K,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            buckets: vec![KBucket::new(BucketRange::full())],
        }
    }

    /// Set the bucket capacity `k`.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Set how many consecutive failures turn a node [NodeState::Bad].
    pub fn with_failure_threshold(mut self, threshold: u8) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the bucket capacity.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns the buckets sorted by the range they cover.
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Returns the node with this id, if known.
    pub fn get(&self, id: &Id) -> Option<&Node> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    // === Public Methods ===

    /// Insert a node into the bucket covering its id, or refresh the existing entry.
    ///
    /// A full bucket covering our own id is split at its midpoint; a full bucket elsewhere
    /// replaces one of its bad nodes, otherwise the incoming node is dropped with
    /// [InsertError::BucketFull].
    pub fn add(&mut self, node: Node) -> Result<InsertOutcome, InsertError> {
        if node.id == self.id {
            return Err(InsertError::LocalId);
        }

        loop {
            let index = self.bucket_index(&node.id);
            let k = self.k;
            let local_id = self.id;
            let bucket = &mut self.buckets[index];

            if let Some(position) = bucket.position(&node.id) {
                let mut existing = bucket.nodes.remove(position);
                existing.refresh(node);

                bucket.nodes.push(existing);
                bucket.last_changed = Instant::now();

                return Ok(InsertOutcome::Updated);
            }

            if bucket.nodes.len() < k {
                bucket.nodes.push(node);
                bucket.last_changed = Instant::now();

                return Ok(InsertOutcome::Inserted);
            }

            if bucket.range.contains(&local_id) && bucket.range.depth < ID_BITS {
                self.split(index);
                continue;
            }

            if let Some(position) = bucket.nodes.iter().position(|n| n.is_bad()) {
                let evicted = bucket.nodes.remove(position);
                bucket.nodes.push(node);
                bucket.last_changed = Instant::now();

                trace!(evicted = ?evicted.id, "Replaced bad node");

                return Ok(InsertOutcome::Replaced(evicted));
            }

            return Err(InsertError::BucketFull);
        }
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) -> Option<Node> {
        let index = self.bucket_index(node_id);
        let bucket = &mut self.buckets[index];

        bucket
            .position(node_id)
            .map(|position| bucket.nodes.remove(position))
    }

    /// Return up to `count` non-bad nodes ordered by XOR distance to `target`,
    /// ties broken by the lower id.
    pub fn closest(&self, target: Id, count: usize) -> Vec<Node> {
        let mut closest = ClosestNodes::new(target);

        for node in self.nodes().filter(|node| !node.is_bad()) {
            closest.add(node.clone());
        }

        closest.take(count).to_vec()
    }

    /// Mark a node as responsive.
    pub fn mark_good(&mut self, id: &Id) -> bool {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];

        match bucket.get_mut(id) {
            Some(node) => {
                node.mark_good();
                bucket.last_changed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Force a node's state to [NodeState::Questionable].
    pub fn mark_questionable(&mut self, id: &Id) -> bool {
        self.set_state(id, NodeState::Questionable)
    }

    /// Force a node's state to [NodeState::Bad].
    pub fn mark_bad(&mut self, id: &Id) -> bool {
        self.set_state(id, NodeState::Bad)
    }

    /// Count a failed request to this node, returning its new state.
    ///
    /// Nodes degrade Good → Questionable → Bad after the configured threshold of
    /// consecutive failures.
    pub fn record_failure(&mut self, id: &Id) -> Option<NodeState> {
        let threshold = self.failure_threshold;
        let index = self.bucket_index(id);

        self.buckets[index]
            .get_mut(id)
            .map(|node| node.record_failure(threshold))
    }

    /// Lazily iterate over the ranges of buckets that did not change in `staleness`.
    pub fn buckets_needing_refresh(
        &self,
        staleness: Duration,
    ) -> impl Iterator<Item = BucketRange> + '_ {
        let now = Instant::now();

        self.buckets
            .iter()
            .filter(move |bucket| now.saturating_duration_since(bucket.last_changed) > staleness)
            .map(|bucket| bucket.range)
    }

    /// Mark the bucket with this range as recently refreshed.
    pub fn touch(&mut self, range: &BucketRange) {
        if let Some(bucket) = self.buckets.iter_mut().find(|b| b.range == *range) {
            bucket.last_changed = Instant::now();
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .iter()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the nodes in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|bucket| bucket.nodes.iter())
    }

    /// Returns `true` if at least one good node of the given address family is known.
    pub fn has_good_node(&self, ipv4: bool) -> bool {
        self.nodes()
            .any(|node| node.is_good() && node.is_ipv4() == ipv4)
    }

    /// Turn this routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.nodes()
            .filter(|n| n.is_good())
            .map(|n| n.address().to_string())
            .collect()
    }

    // === Private Methods ===

    fn set_state(&mut self, id: &Id, state: NodeState) -> bool {
        let index = self.bucket_index(id);

        match self.buckets[index].get_mut(id) {
            Some(node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.range.contains(id))
            .unwrap_or(self.buckets.len() - 1)
    }

    /// Split the bucket at `index` into two halves and redistribute its nodes.
    fn split(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);
        let (lower, upper) = bucket.range.split();

        trace!(depth = lower.depth, "Splitting bucket");

        let mut lower = KBucket::new(lower);
        let mut upper = KBucket::new(upper);
        lower.last_changed = bucket.last_changed;
        upper.last_changed = bucket.last_changed;

        for node in bucket.nodes {
            if lower.range.contains(&node.id) {
                lower.nodes.push(node);
            } else {
                upper.nodes.push(node);
            }
        }

        self.buckets.insert(index, upper);
        self.buckets.insert(index, lower);
    }

    #[cfg(test)]
    fn contains(&self, node_id: &Id) -> bool {
        self.get(node_id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A contiguous range of the identifier space: all ids sharing the first `depth` bits of `prefix`.
pub struct BucketRange {
    prefix: Id,
    depth: usize,
}

impl BucketRange {
    /// The range covering the whole identifier space.
    pub fn full() -> Self {
        Self {
            prefix: Id::from([0; crate::common::ID_SIZE]),
            depth: 0,
        }
    }

    pub fn prefix(&self) -> &Id {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns `true` if `id` falls in this range.
    pub fn contains(&self, id: &Id) -> bool {
        self.depth == 0 || id.common_prefix_len(&self.prefix) >= self.depth
    }

    /// A random id within this range, used as a refresh lookup target.
    pub fn random_id(&self) -> Id {
        Id::random_with_prefix(&self.prefix, self.depth)
    }

    fn split(&self) -> (BucketRange, BucketRange) {
        let depth = self.depth + 1;

        (
            BucketRange {
                prefix: self.prefix.with_bit(self.depth, false),
                depth,
            },
            BucketRange {
                prefix: self.prefix.with_bit(self.depth, true),
                depth,
            },
        )
    }
}

/// Kbuckets are similar to LRU caches that evict bad nodes first,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    range: BucketRange,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    last_changed: Instant,
}

impl KBucket {
    fn new(range: BucketRange) -> Self {
        KBucket {
            range,
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            last_changed: Instant::now(),
        }
    }

    // === Getters ===

    pub fn range(&self) -> &BucketRange {
        &self.range
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == *id)
    }

    fn get(&self, id: &Id) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == *id)
    }

    fn get_mut(&mut self, id: &Id) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id == *id)
    }
}
