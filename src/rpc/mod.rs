//! K-RPC node: routing table, lookups, value store and maintenance, driven by [Rpc::tick].

mod announce_query;
pub mod config;
mod handle_response;
mod info;
mod iterative_query;
mod maintenance;
pub mod server;
mod socket;
mod status;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use tracing::{debug, error, info, trace};

use crate::common::{
    messages::{
        FindNodeRequestArguments, GetValueRequestArguments, Message, MessageType,
        RequestSpecific, RequestTypeSpecific,
    },
    unix_now, Id, Node, RoutingTable, Value,
};
use crate::Error;

use announce_query::AnnounceQuery;
use iterative_query::{IterativeQuery, QueryParams};
use maintenance::Maintenance;
use server::{Server, ValueStore};
use status::StatusTracker;

pub use announce_query::PutError;
pub use config::Config;
pub use info::Info;
pub use iterative_query::GetRequestSpecific;
pub use socket::{
    FailedRequest, KrpcSocket, SendMessageError, MAX_THREAD_BLOCK_DURATION, MAX_UDP_PAYLOAD,
};
pub use status::NodeStatus;

/// Inbound messages handled per tick before moving on to timers and queries.
const MAX_MESSAGES_PER_TICK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a lookup, and the announce that follows it for put queries.
pub struct QueryId(u64);

#[derive(Debug)]
/// Internal Rpc called in the Dht thread loop, useful to create your own actor setup.
pub struct Rpc {
    id: Id,
    signing_key: SigningKey,
    enable_signing: bool,
    value_ttl: Duration,
    put_quorum: usize,
    params: QueryParams,

    socket: KrpcSocket,
    routing_table: RoutingTable,
    server: Server,

    iterative_queries: HashMap<QueryId, IterativeQuery>,
    announce_queries: HashMap<QueryId, AnnounceQuery>,
    next_query_id: u64,

    maintenance: Maintenance,
    status: StatusTracker,

    /// Resolved bootstrap addresses, used again when the routing table empties.
    bootstrap: Vec<SocketAddr>,
    bootstrap_query: Option<QueryId>,
    bootstrapped: bool,
}

impl Rpc {
    /// Create a new Rpc, and start bootstrapping from [Config::bootstrap] if any.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let signing_key = config
            .signing_key
            .clone()
            .unwrap_or_else(|| SigningKey::from_bytes(&rand::random()));
        let id = Id::from_public_key(signing_key.verifying_key().as_bytes());

        let socket = KrpcSocket::new(&config)?;
        let bootstrap = to_socket_address(&config.bootstrap);

        if bootstrap.is_empty() && !config.bootstrap.is_empty() {
            error!(bootstrap = ?config.bootstrap, "Could not resolve any bootstrap node");
        }

        let mut rpc = Rpc {
            id,
            signing_key,
            enable_signing: config.enable_signing,
            value_ttl: config.value_ttl,
            put_quorum: config.put_quorum,
            params: QueryParams {
                alpha: config.alpha.max(1),
                k: config.k.max(1),
                max_rounds: config.max_rounds.max(1),
            },

            socket,
            routing_table: RoutingTable::new(id)
                .with_k(config.k)
                .with_failure_threshold(config.failure_threshold),
            server: Server::new(&config),

            iterative_queries: HashMap::new(),
            announce_queries: HashMap::new(),
            next_query_id: 0,

            maintenance: Maintenance::new(&config),
            status: StatusTracker::new(),

            bootstrap: vec![],
            // Nothing to bootstrap from, this node is the first of its network.
            bootstrapped: config.bootstrap.is_empty(),
            bootstrap_query: None,
        };

        if !bootstrap.is_empty() {
            if let Err(error) = rpc.bootstrap(&bootstrap) {
                debug!(?error, "Could not start bootstrapping");
            }
        }

        Ok(rpc)
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn store(&self) -> &ValueStore {
        self.server.store()
    }

    /// Current (IPv4, IPv6) connectivity status.
    pub fn status(&self) -> (NodeStatus, NodeStatus) {
        self.status.current()
    }

    /// Returns `true` if the last bootstrap lookup found at least one responding node,
    /// or if this node never had anything to bootstrap from.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Returns `true` while a bootstrap lookup is running.
    pub fn bootstrapping(&self) -> bool {
        self.bootstrap_query.is_some()
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Create a value owned by this node if signing is enabled, expiring after [Config::value_ttl].
    pub fn value(&self, data: Bytes, user_type: &str) -> Value {
        let value = Value::new(data, user_type, self.value_ttl);

        if self.enable_signing {
            value.sign(&self.signing_key)
        } else {
            value
        }
    }

    /// Start a `find_node(self)` lookup seeded with the routing table and the given addresses.
    pub fn bootstrap(&mut self, addresses: &[SocketAddr]) -> Result<QueryId, Error> {
        for address in addresses {
            if !self.bootstrap.contains(address) {
                self.bootstrap.push(*address);
            }
        }

        let query_id = self.start_query(
            GetRequestSpecific::FindNode(FindNodeRequestArguments { target: self.id }),
            addresses,
        )?;

        self.bootstrap_query = Some(query_id);
        self.bootstrapped = false;

        Ok(query_id)
    }

    /// Start a lookup for the nodes closest to `target`.
    pub fn find_node(&mut self, target: Id) -> Result<QueryId, Error> {
        self.start_query(
            GetRequestSpecific::FindNode(FindNodeRequestArguments { target }),
            &[],
        )
    }

    /// Start a value lookup for `key`, returning the values already stored locally.
    pub fn get(
        &mut self,
        key: Id,
        user_type: Option<String>,
    ) -> Result<(QueryId, Vec<Value>), Error> {
        let local = self
            .server
            .store_mut()
            .get(&key, unix_now(), user_type.as_deref());

        let query_id = self.start_query(
            GetRequestSpecific::GetValue(GetValueRequestArguments { key, user_type }),
            &[],
        )?;

        if let Some(query) = self.iterative_queries.get_mut(&query_id) {
            for value in &local {
                query.add_value(value);
            }
        }

        Ok((query_id, local))
    }

    /// Store a value locally, then announce it to the closest nodes to `key`.
    ///
    /// The value is republished every [Config::republish_interval] from then on.
    pub fn put(&mut self, key: Id, value: Value) -> Result<QueryId, Error> {
        self.server
            .store_mut()
            .put_local(key, value.clone(), unix_now())?;

        self.announce(key, value)
    }

    /// Stop a lookup and its announce if any, no results are reported for it afterwards.
    pub fn cancel(&mut self, query_id: QueryId) {
        if let Some(mut query) = self.iterative_queries.remove(&query_id) {
            for tid in query.cancel() {
                self.socket.cancel(tid);
            }
        }

        if let Some(query) = self.announce_queries.remove(&query_id) {
            for &tid in query.requests() {
                self.socket.cancel(tid);
            }
        }

        if self.bootstrap_query == Some(query_id) {
            self.bootstrap_query = None;
        }

        trace!(?query_id, "Cancelled query");
    }

    /// Advance the inbound queue, pending requests, queries, maintenance and status.
    pub fn tick(&mut self) -> RpcTickReport {
        let mut report = RpcTickReport::default();

        if let Some((message, from)) = self.socket.recv_from() {
            self.handle_message(message, from, &mut report);

            for _ in 1..MAX_MESSAGES_PER_TICK {
                match self.socket.try_recv_from() {
                    Some((message, from)) => self.handle_message(message, from, &mut report),
                    None => break,
                }
            }
        }

        for failed in self.socket.tick() {
            self.handle_failed_request(failed);
        }

        self.tick_get_queries(&mut report);
        self.tick_put_queries(&mut report);

        self.periodic_node_maintenance();
        self.server.maintain();

        let bootstrapping = self
            .bootstrap_query
            .map(|_| self.socket.local_addr().is_ipv4());

        report.status_changed =
            self.status
                .update(&self.routing_table, self.bootstrapped, bootstrapping);

        report
    }

    // === Private Methods ===

    fn next_query_id(&mut self) -> QueryId {
        let id = QueryId(self.next_query_id);
        self.next_query_id = self.next_query_id.wrapping_add(1);
        id
    }

    fn start_query(
        &mut self,
        request: GetRequestSpecific,
        addresses: &[SocketAddr],
    ) -> Result<QueryId, Error> {
        let target = request.target();
        let mut query = IterativeQuery::new(self.id, request, self.params);

        for node in self.routing_table.closest(target, self.params.k) {
            query.add_candidate(node);
        }

        let local_addr = self.socket.local_addr();
        let addresses = addresses
            .iter()
            .filter(|address| **address != local_addr)
            .copied()
            .collect::<Vec<_>>();

        if let Err(error) = query.start(&mut self.socket, &addresses) {
            debug!(?target, ?error, "Could not start query");
            return Err(error);
        }

        let query_id = self.next_query_id();
        self.iterative_queries.insert(query_id, query);

        Ok(query_id)
    }

    fn announce(&mut self, key: Id, value: Value) -> Result<QueryId, Error> {
        let query_id = self.start_query(
            GetRequestSpecific::FindNode(FindNodeRequestArguments { target: key }),
            &[],
        )?;

        self.announce_queries
            .insert(query_id, AnnounceQuery::new(key, value, self.put_quorum));

        Ok(query_id)
    }

    fn handle_message(&mut self, message: Message, from: SocketAddr, report: &mut RpcTickReport) {
        let transaction_id = message.transaction_id;

        match message.message_type {
            MessageType::Request(request) => {
                if request.requester_id != self.id {
                    // Learned about this node second hand, until it answers one of our requests.
                    let _ = self
                        .routing_table
                        .add(Node::new(request.requester_id, from));
                }

                match self
                    .server
                    .handle_request(&self.routing_table, from, request)
                {
                    MessageType::Response(response) => {
                        self.socket.response(from, transaction_id, response)
                    }
                    MessageType::Error(error) => self.socket.error(from, transaction_id, error),
                    MessageType::Request(_) => {}
                }
            }
            message_type => self.handle_response(
                from,
                Message {
                    message_type,
                    ..message
                },
                report,
            ),
        }
    }

    fn handle_failed_request(&mut self, failed: FailedRequest) {
        let FailedRequest {
            transaction_id,
            to,
            node_id,
        } = failed;

        if let Some(id) = node_id {
            let state = self.routing_table.record_failure(&id);
            debug!(?id, ?to, ?state, "Request failed");
        } else {
            debug!(?to, "Request to bootstrap address failed");
        }

        if let Some(query) = self
            .iterative_queries
            .values_mut()
            .find(|query| query.inflight(transaction_id))
        {
            query.failed(node_id);
        }
    }

    fn tick_get_queries(&mut self, report: &mut RpcTickReport) {
        let mut done = vec![];

        for (id, query) in self.iterative_queries.iter_mut() {
            if query.tick(&mut self.socket) {
                done.push(*id);
            }
        }

        for query_id in done {
            let query = match self.iterative_queries.remove(&query_id) {
                Some(query) => query,
                None => continue,
            };

            let closest: Box<[Node]> = query.responders().take(self.params.k).into();

            if self.bootstrap_query == Some(query_id) {
                self.bootstrap_query = None;
                self.bootstrapped = !closest.is_empty();
                self.log_bootstrap();

                report.bootstrap_done = Some(!closest.is_empty());
            }

            if let Some(announce) = self.announce_queries.get_mut(&query_id) {
                if let Err(error) = announce.start(&mut self.socket, self.id, &closest) {
                    self.announce_queries.remove(&query_id);
                    report.done_put_queries.push((query_id, Err(error)));
                }
            }

            report.done_get_queries.push((query_id, closest));
        }
    }

    fn tick_put_queries(&mut self, report: &mut RpcTickReport) {
        let mut done = vec![];

        for (id, query) in self.announce_queries.iter_mut() {
            if let Some(result) = query.tick(&self.socket) {
                done.push((*id, result));
            }
        }

        for (query_id, result) in done {
            self.announce_queries.remove(&query_id);
            report.done_put_queries.push((query_id, result));
        }
    }

    fn periodic_node_maintenance(&mut self) {
        let decisions = match self
            .maintenance
            .periodic_maintenance_decisions(&self.routing_table)
        {
            Some(decisions) => decisions,
            None => return,
        };

        if decisions.should_bootstrap && self.bootstrap_query.is_none() && !self.bootstrap.is_empty()
        {
            let addresses = self.bootstrap.clone();

            if let Err(error) = self.bootstrap(&addresses) {
                debug!(?error, "Could not bootstrap again");
            }
        }

        for range in decisions.buckets_to_refresh {
            self.routing_table.touch(&range);

            let target = range.random_id();
            if let Err(error) = self.find_node(target) {
                debug!(?error, ?target, "Could not refresh bucket");
            }
        }

        for (id, address) in decisions.nodes_to_ping {
            if self.socket.awaiting(address) {
                continue;
            }

            self.socket.request(
                address,
                Some(id),
                RequestSpecific {
                    requester_id: self.id,
                    request_type: RequestTypeSpecific::Ping,
                },
            );
        }

        if decisions.should_expire {
            let removed = self.server.store_mut().expire_sweep(unix_now());

            if removed > 0 {
                debug!(removed, "Dropped expired values");
            }
        }

        if decisions.should_republish {
            self.republish();
        }
    }

    /// Renew and re-announce the values put by this node.
    fn republish(&mut self) {
        let signer = self.enable_signing.then_some(&self.signing_key);
        let now = unix_now();

        let values = self
            .server
            .store()
            .local_values()
            .into_iter()
            .map(|(key, value)| (key, value.renewed(self.value_ttl, signer)))
            .collect::<Vec<_>>();

        info!(count = values.len(), "Republishing values");

        for (key, value) in values {
            if let Err(error) = self.server.store_mut().put_local(key, value.clone(), now) {
                debug!(?key, ?error, "Could not renew value");
                continue;
            }

            if let Err(error) = self.announce(key, value) {
                debug!(?key, ?error, "Could not republish value");
            }
        }
    }

    fn log_bootstrap(&self) {
        let self_id = self.id;
        let table_size = self.routing_table.size();

        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            debug!(?self_id, table_size, "Populated the routing table");
        }
    }
}

#[derive(Debug, Default)]
/// What happened during one [Rpc::tick].
pub struct RpcTickReport {
    /// Validated values received by value lookups, not seen before by the same lookup.
    pub new_values: Vec<(QueryId, Value)>,
    /// Lookups done in this tick, with the closest responding nodes.
    pub done_get_queries: Vec<(QueryId, Box<[Node]>)>,
    /// Put queries done in this tick, with the number of nodes that accepted the value.
    pub done_put_queries: Vec<(QueryId, Result<usize, PutError>)>,
    /// The new (IPv4, IPv6) status, if it changed.
    pub status_changed: Option<(NodeStatus, NodeStatus)>,
    /// Set when a bootstrap lookup finished, `true` if any node responded.
    pub bootstrap_done: Option<bool>,
}

/// Resolve `host:port` strings, skipping the ones that don't resolve.
pub(crate) fn to_socket_address<T: AsRef<str>>(bootstrap: &[T]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .flat_map(|s| match s.as_ref().to_socket_addrs() {
            Ok(addresses) => addresses.collect::<Vec<_>>(),
            Err(error) => {
                debug!(address = s.as_ref(), ?error, "Could not resolve address");
                vec![]
            }
        })
        .collect()
}
