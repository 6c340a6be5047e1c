//! Answering requests from other nodes, and holding what they announce to us.

pub mod store;
pub mod tokens;

use std::net::SocketAddr;

use tracing::debug;

use crate::common::{
    messages::{
        AnnounceRequestArguments, AnnounceResponseArguments, ErrorSpecific,
        FindNodeRequestArguments, FindNodeResponseArguments, GetValueRequestArguments,
        GetValueResponseArguments, MessageType, PingResponseArguments, RequestSpecific,
        RequestTypeSpecific, ResponseSpecific, ERROR_INVALID_SIGNATURE, ERROR_PROTOCOL,
        ERROR_VALUE_CONFLICT, ERROR_VALUE_EXPIRED, ERROR_VALUE_TOO_BIG,
    },
    unix_now, RoutingTable, Value, ValueError,
};

use super::config::Config;

pub use store::{StoreOutcome, ValueStore};
pub use tokens::Tokens;

/// Bytes of a GetValue response spent on values, leaving room for nodes under
/// [MAX_UDP_PAYLOAD](crate::rpc::MAX_UDP_PAYLOAD).
const VALUES_BUDGET: usize = 60_000;
/// Upper bound of a bencoded value besides its data and user type.
const VALUE_OVERHEAD: usize = 200;

#[derive(Debug)]
/// Request handler, owning the write tokens and the value store.
pub struct Server {
    tokens: Tokens,
    store: ValueStore,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Self {
            tokens: Tokens::new(),
            store: ValueStore::new(config.max_keys, config.max_values_per_key),
        }
    }

    // === Getters ===

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ValueStore {
        &mut self.store
    }

    // === Public Methods ===

    /// Rotate the token secrets if they are due.
    pub fn maintain(&mut self) {
        if self.tokens.should_update() {
            self.tokens.rotate();
        }
    }

    /// Handle an incoming request, returning the response or error to send back.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        from: SocketAddr,
        request: RequestSpecific,
    ) -> MessageType {
        let responder_id = *routing_table.id();
        let requester_id = request.requester_id;

        match request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id,
                }))
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id,
                    token: self.tokens.generate_token(from).into(),
                    nodes: routing_table
                        .closest(target, routing_table.k())
                        .into_boxed_slice(),
                }))
            }
            RequestTypeSpecific::GetValue(GetValueRequestArguments { key, user_type }) => {
                let values = within_budget(self.store.get(&key, unix_now(), user_type.as_deref()));

                MessageType::Response(ResponseSpecific::GetValue(GetValueResponseArguments {
                    responder_id,
                    token: self.tokens.generate_token(from).into(),
                    nodes: routing_table.closest(key, routing_table.k()).into_boxed_slice(),
                    values,
                }))
            }
            RequestTypeSpecific::Announce(AnnounceRequestArguments { key, token, value }) => {
                if !self.tokens.validate(from, &token) {
                    debug!(
                        ?key,
                        ?requester_id,
                        ?from,
                        ?token,
                        request_type = "announce",
                        "Invalid token"
                    );

                    return MessageType::Error(ErrorSpecific {
                        code: ERROR_PROTOCOL,
                        description: "Bad token".to_string(),
                    });
                }

                match self.store.put(key, value, unix_now()) {
                    Ok(outcome) => {
                        debug!(?key, ?requester_id, ?from, ?outcome, "Stored announced value");

                        MessageType::Response(ResponseSpecific::Announce(
                            AnnounceResponseArguments {
                                responder_id,
                                accepted: true,
                            },
                        ))
                    }
                    Err(error) => {
                        debug!(?key, ?requester_id, ?from, ?error, "Rejected announced value");

                        MessageType::Error(rejection(error))
                    }
                }
            }
        }
    }
}

/// Keep the newest values that fit in [VALUES_BUDGET].
fn within_budget(values: Vec<Value>) -> Vec<Value> {
    let mut used = 0;

    values
        .into_iter()
        .take_while(|value| {
            used += value.data().len() + value.user_type().len() + VALUE_OVERHEAD;
            used <= VALUES_BUDGET
        })
        .collect()
}

fn rejection(error: ValueError) -> ErrorSpecific {
    let code = match error {
        ValueError::TooLarge(_) => ERROR_VALUE_TOO_BIG,
        ValueError::InvalidSignature => ERROR_INVALID_SIGNATURE,
        ValueError::Expired => ERROR_VALUE_EXPIRED,
        ValueError::Conflict => ERROR_VALUE_CONFLICT,
    };

    ErrorSpecific {
        code,
        description: error.to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use ed25519_dalek::SigningKey;

    use crate::common::{messages::Message, Id, Node, Value, MAX_VALUE_SIZE};
    use crate::rpc::{config::DEFAULT_MAX_VALUES_PER_KEY, MAX_UDP_PAYLOAD};

    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn setup() -> (Server, RoutingTable, SocketAddr) {
        let server = Server::new(&Config::default());
        let mut routing_table = RoutingTable::new(Id::random());

        for _ in 0..30 {
            let _ = routing_table.add(Node::random());
        }

        (server, routing_table, SocketAddr::from(([127, 0, 0, 1], 7000)))
    }

    fn request(request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific {
            requester_id: Id::random(),
            request_type,
        }
    }

    fn token(server: &mut Server, routing_table: &RoutingTable, from: SocketAddr, key: Id) -> Box<[u8]> {
        match server.handle_request(
            routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                key,
                user_type: None,
            })),
        ) {
            MessageType::Response(ResponseSpecific::GetValue(response)) => response.token,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn announce(key: Id, token: Box<[u8]>, value: Value) -> RequestSpecific {
        request(RequestTypeSpecific::Announce(AnnounceRequestArguments {
            key,
            token,
            value,
        }))
    }

    #[test]
    fn ping() {
        let (mut server, routing_table, from) = setup();

        let response = server.handle_request(&routing_table, from, request(RequestTypeSpecific::Ping));

        assert_eq!(
            response,
            MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: *routing_table.id()
            }))
        );
    }

    #[test]
    fn find_node_returns_closest() {
        let (mut server, routing_table, from) = setup();
        let target = Id::random();

        match server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::FindNode(FindNodeRequestArguments { target })),
        ) {
            MessageType::Response(ResponseSpecific::FindNode(response)) => {
                assert_eq!(
                    response.nodes.to_vec(),
                    routing_table.closest(target, routing_table.k())
                );
                assert!(server.tokens.validate(from, &response.token));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn announce_then_get() {
        let (mut server, routing_table, from) = setup();
        let key = Id::from_key("key");
        let value = Value::text("hello", TTL).sign(&SigningKey::from_bytes(&[7; 32]));

        let token = token(&mut server, &routing_table, from, key);

        assert_eq!(
            server.handle_request(&routing_table, from, announce(key, token, value.clone())),
            MessageType::Response(ResponseSpecific::Announce(AnnounceResponseArguments {
                responder_id: *routing_table.id(),
                accepted: true,
            }))
        );

        match server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                key,
                user_type: None,
            })),
        ) {
            MessageType::Response(ResponseSpecific::GetValue(response)) => {
                assert_eq!(response.values, vec![value]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn forged_token_is_rejected() {
        let (mut server, routing_table, from) = setup();
        let key = Id::from_key("key");

        let token = token(&mut server, &routing_table, from, key);
        let other_address = SocketAddr::from(([10, 0, 0, 9], 7000));

        for (address, token) in [
            (from, vec![1, 2, 3, 4].into_boxed_slice()),
            (other_address, token),
        ] {
            assert_eq!(
                server.handle_request(
                    &routing_table,
                    address,
                    announce(key, token, Value::text("v", TTL))
                ),
                MessageType::Error(ErrorSpecific {
                    code: ERROR_PROTOCOL,
                    description: "Bad token".to_string(),
                })
            );
        }

        assert!(server.store().is_empty());
    }

    #[test]
    fn invalid_values_are_rejected_with_codes() {
        let (mut server, routing_table, from) = setup();
        let key = Id::from_key("key");
        let signed = Value::text("v", TTL).sign(&SigningKey::from_bytes(&[7; 32]));

        let tampered = Value::from_parts(
            signed.id(),
            signed.owner().copied(),
            signed.signature().copied(),
            Bytes::from_static(b"forged"),
            signed.user_type().to_string(),
            signed.created(),
            signed.expires(),
        );
        let too_big = Value::new(vec![0; 1001], "application/octet-stream", TTL);
        let expired = Value::from_parts(1, None, None, Bytes::from_static(b"v"), "text/plain".into(), 1, 2);

        for (value, code) in [
            (tampered, ERROR_INVALID_SIGNATURE),
            (too_big, ERROR_VALUE_TOO_BIG),
            (expired, ERROR_VALUE_EXPIRED),
        ] {
            let token = token(&mut server, &routing_table, from, key);

            match server.handle_request(&routing_table, from, announce(key, token, value)) {
                MessageType::Error(error) => assert_eq!(error.code, code),
                other => panic!("unexpected {:?}", other),
            }
        }

        assert!(server.store().is_empty());
    }

    #[test]
    fn large_values_fit_one_datagram() {
        let (mut server, routing_table, from) = setup();
        let key = Id::from_key("big");
        let signer = SigningKey::from_bytes(&[9; 32]);

        for _ in 0..DEFAULT_MAX_VALUES_PER_KEY {
            let value = Value::new(vec![1; MAX_VALUE_SIZE], "application/octet-stream", TTL)
                .sign(&signer);
            server.store_mut().put(key, value, unix_now()).unwrap();
        }

        let stored = server.store_mut().get(&key, unix_now(), None);
        assert_eq!(stored.len(), DEFAULT_MAX_VALUES_PER_KEY);

        let response = server.handle_request(
            &routing_table,
            from,
            request(RequestTypeSpecific::GetValue(GetValueRequestArguments {
                key,
                user_type: None,
            })),
        );

        match &response {
            MessageType::Response(ResponseSpecific::GetValue(response)) => {
                assert!(!response.values.is_empty());
                assert!(response.values.len() < stored.len());
                assert_eq!(response.values[..], stored[..response.values.len()]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let bytes = Message {
            transaction_id: u32::MAX,
            version: None,
            message_type: response,
        }
        .to_bytes()
        .unwrap();

        assert!(bytes.len() <= MAX_UDP_PAYLOAD);
    }
}
