use tracing::{debug, trace};

use crate::common::{
    messages::{AnnounceRequestArguments, ErrorSpecific, RequestSpecific, RequestTypeSpecific},
    Id, Node, Value,
};

use super::socket::KrpcSocket;

#[derive(Debug)]
/// Once an [super::iterative_query::IterativeQuery] for the key is done, we announce the
/// value to the closest responding nodes using this AnnounceQuery, that keeps track of
/// accepting nodes, and or errors.
pub struct AnnounceQuery {
    pub key: Id,
    pub value: Value,
    quorum: usize,
    /// Nodes that accepted the value
    stored_at: usize,
    inflight_requests: Vec<u32>,
    errors: Vec<(usize, ErrorSpecific)>,
}

impl AnnounceQuery {
    pub fn new(key: Id, value: Value, quorum: usize) -> Self {
        Self {
            key,
            value,
            quorum: quorum.max(1),
            stored_at: 0,
            inflight_requests: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Send the announce request to every node holding a write token.
    pub fn start(
        &mut self,
        socket: &mut KrpcSocket,
        requester_id: Id,
        nodes: &[Node],
    ) -> Result<(), PutError> {
        let key = self.key;
        trace!(?key, nodes = nodes.len(), "AnnounceQuery start");

        for node in nodes {
            if let Some(token) = node.token.clone() {
                let tid = socket.request(
                    node.address,
                    Some(node.id),
                    RequestSpecific {
                        requester_id,
                        request_type: RequestTypeSpecific::Announce(AnnounceRequestArguments {
                            key,
                            token,
                            value: self.value.clone(),
                        }),
                    },
                );

                self.inflight_requests.push(tid);
            }
        }

        if self.inflight_requests.is_empty() {
            Err(PutError::NoClosestNodes)?;
        }

        Ok(())
    }

    pub fn started(&self) -> bool {
        !self.inflight_requests.is_empty()
    }

    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains(&tid)
    }

    /// Transaction ids sent by this query.
    pub fn requests(&self) -> &[u32] {
        &self.inflight_requests
    }

    pub fn success(&mut self) {
        debug!(key = ?self.key, "AnnounceQuery got success response");
        self.stored_at += 1
    }

    pub fn error(&mut self, error: ErrorSpecific) {
        debug!(key = ?self.key, ?error, "AnnounceQuery got error");

        if let Some(pos) = self
            .errors
            .iter()
            .position(|(_, err)| error.code == err.code)
        {
            // Increment the count of the existing error
            self.errors[pos].0 += 1;

            // Move the updated element to maintain the order (highest count first)
            let mut i = pos;
            while i > 0 && self.errors[i].0 > self.errors[i - 1].0 {
                self.errors.swap(i, i - 1);
                i -= 1;
            }
        } else {
            self.errors.push((1, error));
        }
    }

    /// Check if every request got a response or failed.
    ///
    /// Returns the number of accepting nodes once done, if it reached the quorum.
    pub fn tick(&mut self, socket: &KrpcSocket) -> Option<Result<usize, PutError>> {
        if !self.started() || !self.is_done(socket) {
            return None;
        }

        let key = self.key;

        if self.stored_at < self.quorum {
            let most_common_error = self.most_common_error();

            debug!(
                ?key,
                ?most_common_error,
                stored_at = self.stored_at,
                quorum = self.quorum,
                nodes_count = self.inflight_requests.len(),
                "AnnounceQuery: failed"
            );

            return Some(Err(most_common_error
                .map(|(_, error)| PutError::ErrorResponse(error.clone()))
                .unwrap_or(PutError::Timeout)));
        }

        debug!(?key, stored_at = self.stored_at, "AnnounceQuery done successfully");

        Some(Ok(self.stored_at))
    }

    fn is_done(&self, socket: &KrpcSocket) -> bool {
        !self
            .inflight_requests
            .iter()
            .any(|&tid| socket.inflight(tid))
    }

    fn most_common_error(&self) -> Option<&(usize, ErrorSpecific)> {
        self.errors.first()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Put query errors
pub enum PutError {
    /// Failed to find any nodes close to the key holding a write token, usually means
    /// the node failed to bootstrap, so the routing table is empty.
    #[error("Failed to find any nodes close to store value at")]
    NoClosestNodes,

    /// Fewer nodes than the quorum accepted the value, contains the most common error response.
    #[error("Query Error Response: {0:?}")]
    ErrorResponse(ErrorSpecific),

    /// No responses, neither success nor errors.
    #[error("AnnounceQuery timed out with no responses neither success or errors")]
    Timeout,
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
    use std::thread;
    use std::time::Duration;

    use crate::rpc::config::Config;

    use super::*;

    fn socket() -> KrpcSocket {
        KrpcSocket::new(&Config {
            bind_address: Ipv4Addr::LOCALHOST.into(),
            port: Some(0),
            request_timeout: Duration::from_millis(10),
            max_retries: 0,
            ..Default::default()
        })
        .unwrap()
    }

    fn node_with_token(address: SocketAddr) -> Node {
        Node::new_with_token(Id::random(), address, vec![0, 1, 2, 3].into())
    }

    fn query(quorum: usize) -> AnnounceQuery {
        AnnounceQuery::new(
            Id::from_key("key"),
            Value::text("v", Duration::from_secs(60)),
            quorum,
        )
    }

    fn error(code: i32) -> ErrorSpecific {
        ErrorSpecific {
            code,
            description: code.to_string(),
        }
    }

    #[test]
    fn no_nodes_with_tokens() {
        let mut socket = socket();
        let mut query = query(1);

        let without_token = Node::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 9)));

        assert_eq!(
            query.start(&mut socket, Id::random(), &[without_token]),
            Err(PutError::NoClosestNodes)
        );
    }

    #[test]
    fn quorum_reached() {
        let mut socket = socket();
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let address = silent.local_addr().unwrap();

        let mut query = query(2);
        query
            .start(
                &mut socket,
                Id::random(),
                &[node_with_token(address), node_with_token(address), node_with_token(address)],
            )
            .unwrap();

        assert_eq!(query.requests().len(), 3);
        assert!(query.tick(&socket).is_none());

        for tid in query.requests().to_vec() {
            socket.cancel(tid);
        }
        query.success();
        query.success();
        query.error(error(302));

        assert_eq!(query.tick(&socket), Some(Ok(2)));
    }

    #[test]
    fn most_common_error_is_reported() {
        let mut socket = socket();
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let address = silent.local_addr().unwrap();

        let mut query = query(2);
        query
            .start(&mut socket, Id::random(), &vec![node_with_token(address); 4])
            .unwrap();

        for tid in query.requests().to_vec() {
            socket.cancel(tid);
        }
        query.success();
        query.error(error(203));
        query.error(error(206));
        query.error(error(206));

        assert_eq!(query.tick(&socket), Some(Err(PutError::ErrorResponse(error(206)))));
    }

    #[test]
    fn timeout() {
        let mut socket = socket();
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

        let mut query = query(1);
        query
            .start(
                &mut socket,
                Id::random(),
                &[node_with_token(silent.local_addr().unwrap())],
            )
            .unwrap();

        let mut result = None;
        for _ in 0..200 {
            socket.tick();
            result = query.tick(&socket);

            if result.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(result, Some(Err(PutError::Timeout)));
    }
}
