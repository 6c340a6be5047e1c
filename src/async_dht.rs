//! AsyncDht node.

use bytes::Bytes;

use crate::{
    common::{Id, Node, Value},
    dht::{ActorMessage, Dht, GetResponse, GetStream},
    rpc::Info,
    Error,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    /// Returns a reference to the wrapped [Dht].
    pub fn as_sync(&self) -> &Dht {
        &self.0
    }

    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        self.0.id()
    }

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, Error> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.sender.send(ActorMessage::Info(sender))?;

        Ok(receiver.recv_async().await?)
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, Error> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.0.sender.send(ActorMessage::ToBootstrap(sender))?;

        Ok(receiver.recv_async().await?)
    }

    // === Public Methods ===

    /// See [Dht::bootstrap].
    pub fn bootstrap(&self, host: &str, port: u16) -> Result<(), Error> {
        self.0.bootstrap(host, port)
    }

    /// Wait until the running bootstrap lookup is done.
    ///
    /// Returns true if the bootstrapping found at least one node.
    pub async fn bootstrapped(&self) -> Result<bool, Error> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0.sender.send(ActorMessage::Bootstrapped(sender))?;

        Ok(receiver.recv_async().await?)
    }

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.0.sender.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv_async().await;
        }
    }

    // === Find nodes ===

    pub async fn find_node(&self, target: Id) -> Result<Vec<Node>, Error> {
        let (sender, receiver) = flume::bounded::<Result<Vec<Node>, Error>>(1);

        self.0.sender.send(ActorMessage::FindNode(target, sender))?;

        receiver.recv_async().await?
    }

    // === Values ===

    /// See [Dht::get].
    pub fn get(&self, key: &str, user_type: Option<&str>) -> Result<AsyncGetStream, Error> {
        self.0.get(key, user_type).map(AsyncGetStream)
    }

    /// See [Dht::put].
    pub async fn put(&self, key: &str, data: impl Into<Bytes>, user_type: &str) -> Result<Id, Error> {
        let (sender, receiver) = flume::bounded::<Result<Id, Error>>(1);

        self.0.sender.send(ActorMessage::PutData {
            key: Id::from_key(key),
            data: data.into(),
            user_type: user_type.to_string(),
            sender,
        })?;

        receiver.recv_async().await?
    }

    /// See [Dht::put_value].
    pub async fn put_value(&self, key: Id, value: Value) -> Result<Id, Error> {
        let (sender, receiver) = flume::bounded::<Result<Id, Error>>(1);

        self.0.sender.send(ActorMessage::Put(key, value, sender))?;

        receiver.recv_async().await?
    }
}

#[derive(Debug)]
/// Values of a running lookup, see [AsyncDht::get].
pub struct AsyncGetStream(GetStream);

impl AsyncGetStream {
    /// Wait for the next value, returns `None` once the lookup is done.
    pub async fn next(&mut self) -> Option<Value> {
        if self.0.outcome.is_some() {
            return None;
        }

        let response: Result<GetResponse, flume::RecvError> =
            self.0.receiver.recv_async().await;

        self.0.handle(response)
    }

    /// Drain the remaining values and return whether any value was found.
    pub async fn finish(mut self) -> Result<bool, Error> {
        while self.next().await.is_some() {}

        self.0.outcome.take().unwrap_or(Err(Error::Shutdown))
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let dht = Testnet::builder().build().unwrap().as_async();

            dht.shutdown().await;

            assert!(matches!(dht.info().await, Err(Error::Shutdown)));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn bootstrap_with_testnet() {
        async fn test() {
            let testnet = Testnet::new(3).unwrap();

            let dht = Testnet::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            assert!(dht.bootstrapped().await.unwrap());
            assert!(dht.info().await.unwrap().routing_table_size() >= 1);

            let nodes = dht.find_node(*testnet.nodes[2].id()).await.unwrap();
            assert!(nodes.iter().any(|node| node.id() == testnet.nodes[2].id()));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn put_get() {
        async fn test() {
            let testnet = Testnet::new(4).unwrap();

            let a = Testnet::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Testnet::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            a.bootstrapped().await.unwrap();
            b.bootstrapped().await.unwrap();

            a.put("async", &b"Hello World!"[..], "text/plain")
                .await
                .unwrap();

            let mut stream = b.get("async", None).unwrap();
            let value = stream.next().await.expect("No values");

            assert_eq!(value.data().as_ref(), b"Hello World!");
            assert!(stream.finish().await.unwrap());
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn concurrent_puts() {
        let testnet = Testnet::new(4).unwrap();

        let client = Testnet::builder()
            .bootstrap(&testnet.bootstrap)
            .build()
            .unwrap()
            .as_async();

        futures::executor::block_on(client.bootstrapped()).unwrap();

        let mut handles = vec![];

        for i in 0..2 {
            let client = client.clone();

            let handle = std::thread::spawn(move || {
                futures::executor::block_on(async {
                    client
                        .put("concurrent", vec![i as u8], "application/octet-stream")
                        .await
                        .unwrap()
                })
            });

            handles.push(handle);
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Id::from_key("concurrent"));
        }
    }
}
