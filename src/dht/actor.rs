//! The processing thread owning the [Rpc].

use std::collections::HashMap;
use std::net::SocketAddr;

use flume::{Receiver, RecvError, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{Id, Node, Value};
use crate::rpc::{Config, Info, QueryId, Rpc};
use crate::{Error, NodeStatus};

use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct Actor {
    rpc: Rpc,
    receiver: Receiver<ActorMessage>,
    get_senders: HashMap<QueryId, GetSender>,
    find_node_senders: HashMap<QueryId, Sender<Result<Vec<Node>, Error>>>,
    put_senders: HashMap<QueryId, (Id, Sender<Result<Id, Error>>)>,
    bootstrapped_senders: Vec<Sender<bool>>,
    status_observers: Vec<Sender<(NodeStatus, NodeStatus)>>,
}

#[derive(Debug)]
struct GetSender {
    sender: Sender<GetResponse>,
    found: bool,
}

impl Actor {
    pub fn new(config: Config, receiver: Receiver<ActorMessage>) -> std::io::Result<Self> {
        let rpc = Rpc::new(config)?;

        let address = rpc.local_addr();
        let id = rpc.id();
        info!(?address, ?id, "Kadnode listening");

        Ok(Self {
            rpc,
            receiver,
            get_senders: HashMap::new(),
            find_node_senders: HashMap::new(),
            put_senders: HashMap::new(),
            bootstrapped_senders: vec![],
            status_observers: vec![],
        })
    }

    pub fn id(&self) -> Id {
        *self.rpc.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    /// Run until shutdown, or until every [super::Dht] handle is dropped.
    pub fn run(mut self) {
        loop {
            match self.tick() {
                Ok(Some(sender)) => {
                    self.cancel_all();
                    let _ = sender.send(());
                    break;
                }
                Ok(None) => {}
                Err(_) => {
                    self.cancel_all();
                    debug!("Kadnode actor thread was shutdown after Drop.");
                    break;
                }
            }
        }
    }

    /// Returns the shutdown acknowledgement sender if asked to shutdown,
    /// or an error if every sender was dropped.
    fn tick(&mut self) -> Result<Option<Sender<()>>, RecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => return Ok(Some(sender)),
                Ok(actor_message) => self.handle_message(actor_message),
                Err(TryRecvError::Disconnected) => return Err(RecvError::Disconnected),
                Err(TryRecvError::Empty) => break,
            }
        }

        let report = self.rpc.tick();

        for (query_id, value) in report.new_values {
            if let Some(get) = self.get_senders.get_mut(&query_id) {
                get.found = true;
                let _ = get.sender.send(GetResponse::Value(value));
            }
        }

        for (query_id, closest_nodes) in report.done_get_queries {
            if let Some(get) = self.get_senders.remove(&query_id) {
                let _ = get.sender.send(GetResponse::Done(get.found));
            }

            if let Some(sender) = self.find_node_senders.remove(&query_id) {
                let _ = sender.send(Ok(closest_nodes.to_vec()));
            }
        }

        for (query_id, result) in report.done_put_queries {
            if let Some((key, sender)) = self.put_senders.remove(&query_id) {
                let _ = sender.send(result.map(|_| key).map_err(Error::from));
            }
        }

        if let Some(success) = report.bootstrap_done {
            for sender in self.bootstrapped_senders.drain(..) {
                let _ = sender.send(success);
            }
        }

        if let Some(status) = report.status_changed {
            self.status_observers
                .retain(|observer| observer.send(status).is_ok());
        }

        // Callers stopped listening, stop their lookups.
        let abandoned = self
            .get_senders
            .iter()
            .filter(|(_, get)| get.sender.is_disconnected())
            .map(|(query_id, _)| *query_id)
            .collect::<Vec<_>>();

        for query_id in abandoned {
            self.get_senders.remove(&query_id);
            self.rpc.cancel(query_id);
        }

        Ok(None)
    }

    fn handle_message(&mut self, actor_message: ActorMessage) {
        match actor_message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.rpc.info());
            }
            ActorMessage::ToBootstrap(sender) => {
                let _ = sender.send(self.rpc.routing_table().to_bootstrap());
            }
            ActorMessage::Bootstrap(addresses, sender) => {
                let result = self.rpc.bootstrap(&addresses).map(|_| ());

                if let Err(ref error) = result {
                    debug!(?error, ?addresses, "Could not bootstrap");
                }

                let _ = sender.send(result);
            }
            ActorMessage::Bootstrapped(sender) => {
                if self.rpc.bootstrapping() {
                    self.bootstrapped_senders.push(sender);
                } else {
                    let _ = sender.send(self.rpc.bootstrapped());
                }
            }
            ActorMessage::FindNode(target, sender) => match self.rpc.find_node(target) {
                Ok(query_id) => {
                    self.find_node_senders.insert(query_id, sender);
                }
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Get(key, user_type, sender) => match self.rpc.get(key, user_type) {
                Ok((query_id, local)) => {
                    let found = !local.is_empty();

                    for value in local {
                        let _ = sender.send(GetResponse::Value(value));
                    }

                    self.get_senders
                        .insert(query_id, GetSender { sender, found });
                }
                Err(error) => {
                    let _ = sender.send(GetResponse::Error(error));
                }
            },
            ActorMessage::PutData {
                key,
                data,
                user_type,
                sender,
            } => {
                let value = self.rpc.value(data, &user_type);
                self.put(key, value, sender);
            }
            ActorMessage::Put(key, value, sender) => self.put(key, value, sender),
            ActorMessage::ObserveStatus(sender) => {
                self.status_observers.push(sender);
            }
            ActorMessage::Shutdown(_) => {}
        }
    }

    fn put(&mut self, key: Id, value: Value, sender: Sender<Result<Id, Error>>) {
        match self.rpc.put(key, value) {
            Ok(query_id) => {
                self.put_senders.insert(query_id, (key, sender));
            }
            Err(error) => {
                let _ = sender.send(Err(error));
            }
        }
    }

    /// Stop every lookup, no more responses are sent to callers.
    fn cancel_all(&mut self) {
        let queries = self
            .get_senders
            .drain()
            .map(|(query_id, _)| query_id)
            .chain(self.find_node_senders.drain().map(|(query_id, _)| query_id))
            .chain(self.put_senders.drain().map(|(query_id, _)| query_id))
            .collect::<Vec<_>>();

        for query_id in queries {
            self.rpc.cancel(query_id);
        }

        self.bootstrapped_senders.clear();
        self.status_observers.clear();
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    ToBootstrap(Sender<Vec<String>>),
    Bootstrap(Vec<SocketAddr>, Sender<Result<(), Error>>),
    Bootstrapped(Sender<bool>),
    FindNode(Id, Sender<Result<Vec<Node>, Error>>),
    Get(Id, Option<String>, Sender<GetResponse>),
    PutData {
        key: Id,
        data: Bytes,
        user_type: String,
        sender: Sender<Result<Id, Error>>,
    },
    Put(Id, Value, Sender<Result<Id, Error>>),
    ObserveStatus(Sender<(NodeStatus, NodeStatus)>),
    Shutdown(Sender<()>),
}

#[derive(Debug)]
pub(crate) enum GetResponse {
    Value(Value),
    Done(bool),
    Error(Error),
}
