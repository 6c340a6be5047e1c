//! Dht node.

mod actor;

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    thread,
    time::Duration,
};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use flume::{Receiver, Sender};
use tracing::debug;

use crate::{
    common::{Id, Node, Value},
    rpc::{Config, Info, NodeStatus},
    Error,
};

pub(crate) use actor::{ActorMessage, GetResponse};

use actor::Actor;

#[derive(Debug, Clone)]
/// Kadnode node handle.
///
/// Every operation is enqueued to a dedicated processing thread, owning the
/// routing table and the value store. The thread stops on [Dht::shutdown],
/// or once every clone of this handle is dropped.
pub struct Dht {
    pub(crate) sender: Sender<ActorMessage>,
    id: Id,
    local_addr: SocketAddr,
    alive: Receiver<()>,
}

#[derive(Debug, Default, Clone)]
/// A builder for [Dht]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes, as `host:port` strings.
    pub fn bootstrap(&mut self, bootstrap: &[String]) -> &mut Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Add more bootstrap nodes to the current list.
    pub fn extra_bootstrap(&mut self, extra_bootstrap: &[String]) -> &mut Self {
        for address in extra_bootstrap {
            if !self.0.bootstrap.contains(address) {
                self.0.bootstrap.push(address.clone());
            }
        }

        self
    }

    /// Remove the bootstrap nodes, making this node the first of a new network.
    pub fn no_bootstrap(&mut self) -> &mut Self {
        self.0.bootstrap = vec![];

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Set the address to bind the UDP socket to.
    pub fn bind_address(&mut self, bind_address: IpAddr) -> &mut Self {
        self.0.bind_address = bind_address;

        self
    }

    /// Set the time to wait for a response before retransmitting a request.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the retransmissions before a request is considered failed.
    pub fn max_retries(&mut self, max_retries: u8) -> &mut Self {
        self.0.max_retries = max_retries;

        self
    }

    /// Set the signing key, the node id is derived from its public key.
    pub fn signing_key(&mut self, signing_key: SigningKey) -> &mut Self {
        self.0.signing_key = Some(signing_key);

        self
    }

    /// Sign values put by this node, enabled by default.
    pub fn enable_signing(&mut self, enable_signing: bool) -> &mut Self {
        self.0.enable_signing = enable_signing;

        self
    }

    /// Set the bucket capacity `k`.
    pub fn k(&mut self, k: usize) -> &mut Self {
        self.0.k = k;

        self
    }

    /// Set the lookup concurrency `alpha`.
    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.0.alpha = alpha;

        self
    }

    /// Set the minimum number of nodes that must store a value for a put to succeed.
    pub fn put_quorum(&mut self, put_quorum: usize) -> &mut Self {
        self.0.put_quorum = put_quorum;

        self
    }

    /// Set the consecutive failures before a node is considered bad.
    pub fn failure_threshold(&mut self, failure_threshold: u8) -> &mut Self {
        self.0.failure_threshold = failure_threshold;

        self
    }

    /// Set how often maintenance runs.
    pub fn maintenance_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.maintenance_interval = interval;

        self
    }

    /// Set how often stale buckets are refreshed.
    pub fn bucket_refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.bucket_refresh_interval = interval;

        self
    }

    /// Set how often values put by this node are re-announced.
    pub fn republish_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.republish_interval = interval;

        self
    }

    /// Set the lifetime of values put by this node.
    pub fn value_ttl(&mut self, value_ttl: Duration) -> &mut Self {
        self.0.value_ttl = value_ttl;

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> io::Result<Dht> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the UDP socket.
    pub fn new(config: Config) -> io::Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let (ready_sender, ready_receiver) = flume::bounded::<io::Result<(Id, SocketAddr)>>(1);
        let (alive_sender, alive) = flume::bounded::<()>(1);

        thread::Builder::new()
            .name("kadnode".to_string())
            .spawn(move || {
                // Dropped when the thread exits, waking up `join()`.
                let _alive_sender = alive_sender;

                match Actor::new(config, receiver) {
                    Ok(actor) => {
                        let _ = ready_sender.send(Ok((actor.id(), actor.local_addr())));
                        actor.run();
                    }
                    Err(error) => {
                        let _ = ready_sender.send(Err(error));
                    }
                }
            })?;

        let (id, local_addr) = ready_receiver.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "Kadnode thread exited before starting")
        })??;

        Ok(Dht {
            sender,
            id,
            local_addr,
            alive,
        })
    }

    /// Start a node listening on `port`, with an optional identity.
    ///
    /// A new signing key is generated if none is given.
    pub fn run(port: u16, signing_key: Option<SigningKey>, enable_signing: bool) -> io::Result<Self> {
        Dht::new(Config {
            port: Some(port),
            signing_key,
            enable_signing,
            ..Default::default()
        })
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// This node's [Id], derived from its signing key.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, Error> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.sender.send(ActorMessage::Info(sender))?;

        Ok(receiver.recv()?)
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, Error> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.sender.send(ActorMessage::ToBootstrap(sender))?;

        Ok(receiver.recv()?)
    }

    // === Public Methods ===

    /// Bootstrap from `host:port`, populating the routing table with a lookup of our own id.
    ///
    /// Returns [Error::BootstrapFailed] if the address doesn't resolve, and
    /// [Error::NetworkUnreachable] if no request could be sent to it.
    /// Otherwise returns once the lookup started, see [Dht::bootstrapped] to wait for it.
    pub fn bootstrap(&self, host: &str, port: u16) -> Result<(), Error> {
        let addresses = match (host, port).to_socket_addrs() {
            Ok(addresses) => addresses.collect::<Vec<_>>(),
            Err(error) => {
                debug!(?error, host, port, "Could not resolve bootstrap address");
                vec![]
            }
        };

        if addresses.is_empty() {
            return Err(Error::BootstrapFailed);
        }

        let (sender, receiver) = flume::bounded::<Result<(), Error>>(1);

        self.sender.send(ActorMessage::Bootstrap(addresses, sender))?;

        receiver.recv()?
    }

    /// Wait until the running bootstrap lookup is done.
    ///
    /// Returns true if the bootstrapping found at least one node,
    /// or if this node had nothing to bootstrap from.
    pub fn bootstrapped(&self) -> Result<bool, Error> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.sender.send(ActorMessage::Bootstrapped(sender))?;

        Ok(receiver.recv()?)
    }

    /// Block until the node is shut down.
    pub fn join(&self) {
        let _ = self.alive.recv();
    }

    /// Stop the processing thread, pending operations are dropped without completing.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.sender.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }

    /// Call `callback` on a helper thread every time the (IPv4, IPv6) status changes.
    pub fn on_status_changed<F>(&self, mut callback: F) -> Result<(), Error>
    where
        F: FnMut(NodeStatus, NodeStatus) + Send + 'static,
    {
        let (sender, receiver) = flume::unbounded::<(NodeStatus, NodeStatus)>();

        self.sender.send(ActorMessage::ObserveStatus(sender))?;

        thread::spawn(move || {
            for (ipv4, ipv6) in receiver.iter() {
                callback(ipv4, ipv6);
            }
        });

        Ok(())
    }

    // === Find nodes ===

    /// Find the closest responding nodes to `target`.
    pub fn find_node(&self, target: Id) -> Result<Vec<Node>, Error> {
        let (sender, receiver) = flume::bounded::<Result<Vec<Node>, Error>>(1);

        self.sender.send(ActorMessage::FindNode(target, sender))?;

        receiver.recv()?
    }

    // === Values ===

    /// Look up the values stored under `key`, optionally only those of a `user_type`.
    ///
    /// Values are yielded as they arrive, dropping the [GetStream] stops the lookup.
    pub fn get(&self, key: &str, user_type: Option<&str>) -> Result<GetStream, Error> {
        // Unbounded so the processing thread never blocks on a slow consumer.
        let (sender, receiver) = flume::unbounded::<GetResponse>();

        self.sender.send(ActorMessage::Get(
            Id::from_key(key),
            user_type.map(String::from),
            sender,
        ))?;

        Ok(GetStream {
            receiver,
            outcome: None,
        })
    }

    /// Look up the values under `key` on a helper thread.
    ///
    /// `on_value` is called for every value, returning `false` stops the lookup.
    /// `on_done` is called once, with `true` if any value was found.
    pub fn get_with<V, D>(
        &self,
        key: &str,
        user_type: Option<&str>,
        mut on_value: V,
        on_done: D,
    ) -> Result<(), Error>
    where
        V: FnMut(&Value) -> bool + Send + 'static,
        D: FnOnce(bool) + Send + 'static,
    {
        let mut stream = self.get(key, user_type)?;

        thread::spawn(move || {
            let mut stopped = false;

            for value in stream.by_ref() {
                if !on_value(&value) {
                    stopped = true;
                    break;
                }
            }

            if stopped {
                // Cancels the lookup before reporting.
                drop(stream);
                on_done(true);
            } else {
                on_done(matches!(stream.finish(), Ok(true)));
            }
        });

        Ok(())
    }

    /// Store `data` under `key` on the closest nodes, and keep republishing it.
    ///
    /// The value is signed with this node's key unless signing is disabled.
    /// Returns the key's [Id] once enough nodes stored the value.
    pub fn put(&self, key: &str, data: impl Into<Bytes>, user_type: &str) -> Result<Id, Error> {
        let (sender, receiver) = flume::bounded::<Result<Id, Error>>(1);

        self.sender.send(ActorMessage::PutData {
            key: Id::from_key(key),
            data: data.into(),
            user_type: user_type.to_string(),
            sender,
        })?;

        receiver.recv()?
    }

    /// Same as [Dht::put], calling `on_done` on a helper thread instead of blocking.
    pub fn put_with<D>(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        user_type: &str,
        on_done: D,
    ) -> Result<(), Error>
    where
        D: FnOnce(Result<Id, Error>) + Send + 'static,
    {
        let (sender, receiver) = flume::bounded::<Result<Id, Error>>(1);

        self.sender.send(ActorMessage::PutData {
            key: Id::from_key(key),
            data: data.into(),
            user_type: user_type.to_string(),
            sender,
        })?;

        thread::spawn(move || {
            // Nothing is reported if the node shuts down first.
            if let Ok(result) = receiver.recv() {
                on_done(result);
            }
        });

        Ok(())
    }

    /// Store an already built [Value] under `key`.
    pub fn put_value(&self, key: Id, value: Value) -> Result<Id, Error> {
        let (sender, receiver) = flume::bounded::<Result<Id, Error>>(1);

        self.sender.send(ActorMessage::Put(key, value, sender))?;

        receiver.recv()?
    }
}

#[derive(Debug)]
/// Values of a running lookup, see [Dht::get].
pub struct GetStream {
    pub(crate) receiver: Receiver<GetResponse>,
    pub(crate) outcome: Option<Result<bool, Error>>,
}

impl GetStream {
    /// Drain the remaining values and return whether any value was found.
    pub fn finish(mut self) -> Result<bool, Error> {
        for _ in self.by_ref() {}

        self.outcome.take().unwrap_or(Err(Error::Shutdown))
    }

    pub(crate) fn handle(&mut self, response: Result<GetResponse, flume::RecvError>) -> Option<Value> {
        match response {
            Ok(GetResponse::Value(value)) => Some(value),
            Ok(GetResponse::Done(found)) => {
                self.outcome = Some(Ok(found));
                None
            }
            Ok(GetResponse::Error(error)) => {
                self.outcome = Some(Err(error));
                None
            }
            Err(_) => {
                self.outcome = Some(Err(Error::Shutdown));
                None
            }
        }
    }
}

impl Iterator for GetStream {
    type Item = Value;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }

        let response = self.receiver.recv();
        self.handle(response)
    }
}

#[derive(Debug)]
/// Create a testnet of Dht nodes on localhost, to run tests against.
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Start `count` nodes, each one bootstrapping from the first.
    pub fn new(count: usize) -> io::Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let node = Testnet::builder().bootstrap(&bootstrap).build()?;

            if i == 0 {
                bootstrap.push(node.local_addr().to_string());
            }

            nodes.push(node);
        }

        for node in nodes.iter().skip(1) {
            let _ = node.bootstrapped();
        }

        Ok(Self { bootstrap, nodes })
    }

    /// A builder for nodes joining a local testnet, with short timeouts.
    pub fn builder() -> DhtBuilder {
        let mut builder = Dht::builder();

        builder
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .request_timeout(Duration::from_millis(100))
            .max_retries(1);

        builder
    }
}
