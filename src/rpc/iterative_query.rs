//! Manage iterative queries and their corresponding request/response.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::socket::KrpcSocket;
use crate::common::{
    messages::{
        FindNodeRequestArguments, GetValueRequestArguments, RequestSpecific, RequestTypeSpecific,
    },
    ClosestNodes, Id, Node, Value,
};
use crate::Error;

#[derive(Debug, Clone)]
pub enum GetRequestSpecific {
    FindNode(FindNodeRequestArguments),
    GetValue(GetValueRequestArguments),
}

impl GetRequestSpecific {
    pub fn target(&self) -> Id {
        match self {
            GetRequestSpecific::FindNode(args) => args.target,
            GetRequestSpecific::GetValue(args) => args.key,
        }
    }
}

/// Lookup parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryParams {
    pub alpha: usize,
    pub k: usize,
    pub max_rounds: usize,
}

/// A round based process of querying the closest known nodes to a target.
///
/// Every round sends the request to up to `alpha` of the `k` closest nodes that weren't
/// queried yet, and waits until all of them responded or failed. A round that finds a
/// closer node is followed by another one, otherwise all remaining unqueried nodes among
/// the `k` closest are queried in one final sweep and the query is done.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    pub request: RequestSpecific,
    params: QueryParams,
    closest: ClosestNodes,
    responders: ClosestNodes,
    queried: HashSet<Id>,
    visited: HashSet<SocketAddr>,
    inflight_requests: Vec<u32>,
    round: usize,
    improved: bool,
    final_sweep: bool,
    done: bool,
    values: HashSet<u64>,
}

impl IterativeQuery {
    pub fn new(requester_id: Id, request: GetRequestSpecific, params: QueryParams) -> Self {
        let target = request.target();

        let request_type = match request {
            GetRequestSpecific::FindNode(s) => RequestTypeSpecific::FindNode(s),
            GetRequestSpecific::GetValue(s) => RequestTypeSpecific::GetValue(s),
        };

        trace!(?target, ?request_type, "New Query");

        Self {
            request: RequestSpecific {
                requester_id,
                request_type,
            },
            params,

            closest: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),

            queried: HashSet::new(),
            visited: HashSet::new(),
            inflight_requests: Vec::new(),

            round: 0,
            improved: false,
            final_sweep: false,
            done: false,

            values: HashSet::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.responders.target()
    }

    /// The user type values of a value lookup are restricted to, if any.
    pub fn user_type(&self) -> Option<&str> {
        match &self.request.request_type {
            RequestTypeSpecific::GetValue(args) => args.user_type.as_deref(),
            _ => None,
        }
    }

    /// Closest nodes that responded to this query, with their write tokens.
    pub fn responders(&self) -> &ClosestNodes {
        &self.responders
    }

    // === Public Methods ===

    /// Seed the shortlist with a node, usually from the routing table.
    pub fn add_candidate(&mut self, node: Node) {
        if node.id == self.request.requester_id {
            return;
        }

        if self.closest.contains(&node.id) {
            self.closest.add(node);
            return;
        }

        if let Some(index) = self.closest.add(node) {
            if index < self.params.k {
                self.improved = true;
            }
        }
    }

    /// Start the first round by visiting explicit addresses and the closest candidates.
    ///
    /// Fails with [Error::NotBootstrapped] if there was nobody to ask, or with
    /// [Error::NetworkUnreachable] if none of the requests could be sent.
    pub fn start(
        &mut self,
        socket: &mut KrpcSocket,
        addresses: &[SocketAddr],
    ) -> Result<(), Error> {
        self.round = 1;
        self.improved = false;

        for address in addresses {
            self.visit(socket, *address);
        }

        self.visit_closest(socket, self.params.alpha);

        if self.inflight_requests.is_empty() {
            return Err(Error::NotBootstrapped);
        }

        if self
            .inflight_requests
            .iter()
            .all(|&tid| socket.send_failed(tid))
        {
            return Err(Error::NetworkUnreachable);
        }

        Ok(())
    }

    /// Return true if a response (by transaction_id) is expected by this query.
    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains(&tid)
    }

    /// Add a node that responded with a token as a probable storage node.
    pub fn add_responding_node(&mut self, node: Node) {
        self.queried.insert(node.id);
        self.closest.add(node.clone());
        self.responders.add(node);
    }

    /// A request of this query failed permanently, drop the node from the shortlist.
    pub fn failed(&mut self, node_id: Option<Id>) {
        if let Some(id) = node_id {
            self.closest.remove(&id);
        }
    }

    /// Record a value, returns false if it was seen before.
    pub fn add_value(&mut self, value: &Value) -> bool {
        self.values.insert(value.id())
    }

    /// Advance to the next round once every request of the current one resolved.
    ///
    /// Returns true if the query is done.
    pub fn tick(&mut self, socket: &mut KrpcSocket) -> bool {
        if self.done {
            return true;
        }

        if self
            .inflight_requests
            .iter()
            .any(|&tid| socket.inflight(tid))
        {
            return false;
        }

        self.inflight_requests.clear();

        if self.final_sweep || self.round >= self.params.max_rounds {
            return self.finish();
        }

        let improved = std::mem::take(&mut self.improved);
        self.round += 1;

        if improved && self.visit_closest(socket, self.params.alpha) > 0 {
            return false;
        }

        self.final_sweep = true;

        if self.visit_closest(socket, self.params.k) > 0 {
            return false;
        }

        self.finish()
    }

    /// Stop querying, returning the transaction ids that were still inflight.
    pub fn cancel(&mut self) -> Vec<u32> {
        self.done = true;
        std::mem::take(&mut self.inflight_requests)
    }

    // === Private Methods ===

    fn finish(&mut self) -> bool {
        self.done = true;

        debug!(
            target = ?self.target(),
            rounds = self.round,
            candidates = self.closest.len(),
            visited = self.queried.len() + self.visited.len(),
            responders = self.responders.len(),
            values = self.values.len(),
            "Done query"
        );

        true
    }

    /// Visit an explicit address, the node behind it is not known yet.
    fn visit(&mut self, socket: &mut KrpcSocket, address: SocketAddr) {
        if !self.visited.insert(address) {
            return;
        }

        let tid = socket.request(address, None, self.request.clone());
        self.inflight_requests.push(tid);
    }

    /// Visit up to `count` unqueried nodes among the k closest, returns how many were visited.
    fn visit_closest(&mut self, socket: &mut KrpcSocket, count: usize) -> usize {
        let to_visit = self
            .closest
            .take(self.params.k)
            .iter()
            .filter(|node| !self.queried.contains(&node.id) && !self.visited.contains(&node.address))
            .take(count)
            .map(|node| (node.id, node.address))
            .collect::<Vec<_>>();

        for (id, address) in &to_visit {
            self.queried.insert(*id);

            let tid = socket.request(*address, Some(*id), self.request.clone());
            self.inflight_requests.push(tid);
        }

        to_visit.len()
    }
}
