//! Serialize and deserialize Krpc-style messages.

mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::common::{Id, InvalidIdSize, Node, Value, ID_SIZE};

/// Version sent with every message.
pub const VERSION: [u8; 4] = [b'K', b'N', 0, 1];

/// Generic error.
pub const ERROR_GENERIC: i32 = 201;
/// Malformed packet, invalid arguments or bad token.
pub const ERROR_PROTOCOL: i32 = 203;
/// Method unknown.
pub const ERROR_METHOD_UNKNOWN: i32 = 204;
/// Value data too large.
pub const ERROR_VALUE_TOO_BIG: i32 = 205;
/// Value signature doesn't match its owner.
pub const ERROR_INVALID_SIGNATURE: i32 = 206;
/// Value already expired.
pub const ERROR_VALUE_EXPIRED: i32 = 207;
/// A different value with the same id is already stored.
pub const ERROR_VALUE_CONFLICT: i32 = 302;

const NODE4_BYTE_SIZE: usize = ID_SIZE + 6;
const NODE6_BYTE_SIZE: usize = ID_SIZE + 18;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// The version of the requester or responder.
    pub version: Option<[u8; 4]>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetValue(GetValueRequestArguments),
    Announce(AnnounceRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetValue(GetValueResponseArguments),
    Announce(AnnounceResponseArguments),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    /// Write token for announcing to the responder.
    pub token: Box<[u8]>,
    pub nodes: Box<[Node]>,
}

// === GET ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueRequestArguments {
    pub key: Id,
    /// Only return values of this user type.
    pub user_type: Option<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueResponseArguments {
    pub responder_id: Id,
    pub token: Box<[u8]>,
    pub nodes: Box<[Node]>,
    /// Not validated yet.
    pub values: Vec<Value>,
}

// === ANNOUNCE ===

#[derive(Debug, PartialEq, Clone)]
pub struct AnnounceRequestArguments {
    pub key: Id,
    pub token: Box<[u8]>,
    pub value: Value,
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnounceResponseArguments {
    pub responder_id: Id,
    pub accepted: bool,
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::Ping => internal::DHTRequestSpecific::Ping {
                        arguments: internal::DHTPingRequestArguments {
                            id: *requester_id.as_bytes(),
                        },
                    },
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: *requester_id.as_bytes(),
                                target: *find_node_args.target.as_bytes(),
                            },
                        }
                    }
                    RequestTypeSpecific::GetValue(get_value_args) => {
                        internal::DHTRequestSpecific::GetValue {
                            arguments: internal::DHTGetValueRequestArguments {
                                id: *requester_id.as_bytes(),
                                target: *get_value_args.key.as_bytes(),
                                utype: get_value_args.user_type,
                            },
                        }
                    }
                    RequestTypeSpecific::Announce(announce_args) => {
                        internal::DHTRequestSpecific::Announce {
                            arguments: internal::DHTAnnounceRequestArguments {
                                id: *requester_id.as_bytes(),
                                target: *announce_args.key.as_bytes(),
                                token: announce_args.token,
                                value: value_to_serde(&announce_args.value),
                            },
                        }
                    }
                }),

                MessageType::Response(res) => internal::DHTMessageVariant::Response(match res {
                    ResponseSpecific::Ping(ping_args) => internal::DHTResponseSpecific::Ping {
                        arguments: internal::DHTPingResponseArguments {
                            id: *ping_args.responder_id.as_bytes(),
                        },
                    },
                    ResponseSpecific::FindNode(find_node_args) => {
                        let (nodes, nodes6) = nodes_to_bytes(&find_node_args.nodes);

                        internal::DHTResponseSpecific::FindNode {
                            arguments: internal::DHTFindNodeResponseArguments {
                                id: *find_node_args.responder_id.as_bytes(),
                                token: find_node_args.token,
                                nodes,
                                nodes6,
                            },
                        }
                    }
                    ResponseSpecific::GetValue(get_value_args) => {
                        let (nodes, nodes6) = nodes_to_bytes(&get_value_args.nodes);

                        internal::DHTResponseSpecific::GetValue {
                            arguments: internal::DHTGetValueResponseArguments {
                                id: *get_value_args.responder_id.as_bytes(),
                                token: get_value_args.token,
                                nodes,
                                nodes6,
                                values: get_value_args.values.iter().map(value_to_serde).collect(),
                            },
                        }
                    }
                    ResponseSpecific::Announce(announce_args) => {
                        internal::DHTResponseSpecific::Announce {
                            arguments: internal::DHTAnnounceResponseArguments {
                                id: *announce_args.responder_id.as_bytes(),
                                ok: if announce_args.accepted { 1 } else { 0 },
                            },
                        }
                    }
                }),

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, DecodeMessageError> {
        Ok(Message {
            transaction_id: u32::from_be_bytes(msg.transaction_id),
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from(arguments.target),
                            }),
                        },
                        internal::DHTRequestSpecific::GetValue { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::GetValue(GetValueRequestArguments {
                                key: Id::from(arguments.target),
                                user_type: arguments.utype,
                            }),
                        },
                        internal::DHTRequestSpecific::Announce { arguments } => RequestSpecific {
                            requester_id: Id::from(arguments.id),
                            request_type: RequestTypeSpecific::Announce(AnnounceRequestArguments {
                                key: Id::from(arguments.target),
                                token: arguments.token,
                                value: value_from_serde(arguments.value)?,
                            }),
                        },
                    })
                }

                internal::DHTMessageVariant::Response(res_variant) => {
                    MessageType::Response(match res_variant {
                        internal::DHTResponseSpecific::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: Id::from(arguments.id),
                            })
                        }
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id: Id::from(arguments.id),
                                token: arguments.token,
                                nodes: bytes_to_nodes(&arguments.nodes, arguments.nodes6.as_deref())?,
                            })
                        }
                        internal::DHTResponseSpecific::GetValue { arguments } => {
                            ResponseSpecific::GetValue(GetValueResponseArguments {
                                responder_id: Id::from(arguments.id),
                                token: arguments.token,
                                nodes: bytes_to_nodes(&arguments.nodes, arguments.nodes6.as_deref())?,
                                values: arguments
                                    .values
                                    .into_iter()
                                    .map(value_from_serde)
                                    .collect::<Result<_, _>>()?,
                            })
                        }
                        internal::DHTResponseSpecific::Announce { arguments } => {
                            ResponseSpecific::Announce(AnnounceResponseArguments {
                                responder_id: Id::from(arguments.id),
                                accepted: arguments.ok != 0,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_serde_message().to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeMessageError> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// Return the Id of the sender of the Message, Error messages carry none.
    pub fn get_author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(arguments) => arguments.requester_id,
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::GetValue(arguments) => arguments.responder_id,
                ResponseSpecific::Announce(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }

    /// If the response contains closer nodes to the target, return them.
    pub fn get_closer_nodes(&self) -> Option<&[Node]> {
        match &self.message_type {
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::FindNode(arguments) => Some(&arguments.nodes),
                ResponseSpecific::GetValue(arguments) => Some(&arguments.nodes),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_token(&self) -> Option<(Id, &[u8])> {
        match &self.message_type {
            MessageType::Response(response_variant) => match response_variant {
                ResponseSpecific::FindNode(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                ResponseSpecific::GetValue(arguments) => {
                    Some((arguments.responder_id, &arguments.token))
                }
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.message_type, MessageType::Request(_))
    }
}

fn value_to_serde(value: &Value) -> internal::DHTValue {
    internal::DHTValue {
        id: value.id().to_be_bytes(),
        owner: value.owner().copied(),
        sig: value.signature().copied(),
        data: value.data().to_vec().into(),
        user_type: value.user_type().to_string(),
        created: value.created().try_into().unwrap_or(i64::MAX),
        expires: value.expires().try_into().unwrap_or(i64::MAX),
    }
}

fn value_from_serde(value: internal::DHTValue) -> Result<Value, DecodeMessageError> {
    Ok(Value::from_parts(
        u64::from_be_bytes(value.id),
        value.owner,
        value.sig,
        Bytes::from(value.data.into_vec()),
        value.user_type,
        value
            .created
            .try_into()
            .map_err(|_| DecodeMessageError::InvalidValue("negative creation time"))?,
        value
            .expires
            .try_into()
            .map_err(|_| DecodeMessageError::InvalidValue("negative expiry time"))?,
    ))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr {
        SocketAddr::V4(v4) => bytes.extend(v4.ip().octets()),
        SocketAddr::V6(v6) => bytes.extend(v6.ip().octets()),
    }

    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

fn bytes_to_sockaddr(bytes: &[u8]) -> Result<SocketAddr, DecodeMessageError> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[..16]
                .try_into()
                .map_err(|_| DecodeMessageError::InvalidSocketAddr(bytes.len()))?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        len => Err(DecodeMessageError::InvalidSocketAddr(len)),
    }
}

/// Compact node info, split by address family.
fn nodes_to_bytes(nodes: &[Node]) -> (Box<[u8]>, Option<Box<[u8]>>) {
    let mut nodes4 = Vec::with_capacity(NODE4_BYTE_SIZE * nodes.len());
    let mut nodes6 = Vec::new();

    for node in nodes {
        let buffer = if node.is_ipv4() {
            &mut nodes4
        } else {
            &mut nodes6
        };

        buffer.extend(node.id().as_bytes());
        buffer.extend(sockaddr_to_bytes(&node.address()));
    }

    (
        nodes4.into(),
        if nodes6.is_empty() {
            None
        } else {
            Some(nodes6.into())
        },
    )
}

fn bytes_to_nodes(nodes4: &[u8], nodes6: Option<&[u8]>) -> Result<Box<[Node]>, DecodeMessageError> {
    let mut nodes = Vec::with_capacity(nodes4.len() / NODE4_BYTE_SIZE);

    for (bytes, size) in [(nodes4, NODE4_BYTE_SIZE), (nodes6.unwrap_or_default(), NODE6_BYTE_SIZE)] {
        if bytes.len() % size != 0 {
            return Err(DecodeMessageError::InvalidNodesLength(bytes.len()));
        }

        for chunk in bytes.chunks_exact(size) {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

            nodes.push(Node::new(id, address));
        }
    }

    Ok(nodes.into())
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding a [Message] from a datagram.
pub enum DecodeMessageError {
    #[error(transparent)]
    /// Not valid bencode, or not a known message shape.
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Wrong number of bytes for nodes: {0}")]
    InvalidNodesLength(usize),

    #[error("Wrong number of bytes for a socket address: {0}")]
    InvalidSocketAddr(usize),

    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use super::*;

    fn roundtrip(message: Message) {
        let serde_message = message.clone().into_serde_message();
        let parsed_serde_message = internal::DHTMessage::from_bytes(
            &serde_message.to_bytes().unwrap(),
        )
        .unwrap();
        let parsed_msg = Message::from_serde_message(parsed_serde_message).unwrap();

        assert_eq!(parsed_msg, message);
    }

    #[test]
    fn test_ping_request() {
        let original_msg = Message {
            transaction_id: 258,
            version: Some(VERSION),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            }),
        };

        let bytes = original_msg.to_bytes().unwrap();

        // Transaction ids are always 4 bytes.
        assert!(bytes.windows(7).any(|w| w == b"1:t4:\0\0"));

        roundtrip(original_msg);
    }

    #[test]
    fn test_ping_response() {
        roundtrip(Message {
            transaction_id: 258,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        });
    }

    #[test]
    fn test_find_node_request() {
        roundtrip(Message {
            transaction_id: u32::MAX,
            version: Some(VERSION),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::random(),
                }),
            }),
        });
    }

    #[test]
    fn test_find_node_response_mixed_families() {
        let nodes: Box<[Node]> = vec![
            Node::new(Id::random(), "49.50.52.52:5354".parse().unwrap()),
            Node::new(Id::random(), "[2001:db8::1]:6881".parse().unwrap()),
            Node::new(Id::random(), "127.0.0.1:4222".parse().unwrap()),
        ]
        .into();

        let message = Message {
            transaction_id: 7,
            version: Some(VERSION),
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    token: [1, 2, 3, 4].into(),
                    nodes: nodes.clone(),
                },
            )),
        };

        let parsed = Message::from_bytes(message.to_bytes().unwrap()).unwrap();
        let parsed_nodes = parsed.get_closer_nodes().unwrap();

        assert_eq!(parsed_nodes.len(), 3);
        for node in nodes.iter() {
            assert!(parsed_nodes.contains(node));
        }
        assert_eq!(parsed.get_token().unwrap().1, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_get_value_request() {
        roundtrip(Message {
            transaction_id: 3,
            version: Some(VERSION),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::GetValue(GetValueRequestArguments {
                    key: Id::from_key("k"),
                    user_type: Some("text/plain".to_string()),
                }),
            }),
        });
    }

    #[test]
    fn test_get_value_response() {
        let signer = SigningKey::from_bytes(&[3; 32]);

        roundtrip(Message {
            transaction_id: 3,
            version: Some(VERSION),
            message_type: MessageType::Response(ResponseSpecific::GetValue(
                GetValueResponseArguments {
                    responder_id: Id::random(),
                    token: [9; 4].into(),
                    nodes: vec![Node::new(Id::random(), "1.2.3.4:5".parse().unwrap())].into(),
                    values: vec![
                        Value::text("v", Duration::from_secs(600)).sign(&signer),
                        Value::new(vec![0, 1, 2], "application/octet-stream", Duration::from_secs(60)),
                    ],
                },
            )),
        });
    }

    #[test]
    fn test_get_value_response_without_values() {
        roundtrip(Message {
            transaction_id: 3,
            version: Some(VERSION),
            message_type: MessageType::Response(ResponseSpecific::GetValue(
                GetValueResponseArguments {
                    responder_id: Id::random(),
                    token: [9; 4].into(),
                    nodes: vec![].into(),
                    values: vec![],
                },
            )),
        });
    }

    #[test]
    fn test_announce() {
        let value = Value::text("v", Duration::from_secs(600));

        roundtrip(Message {
            transaction_id: 11,
            version: Some(VERSION),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Announce(AnnounceRequestArguments {
                    key: Id::from_key("k"),
                    token: [4; 4].into(),
                    value,
                }),
            }),
        });

        roundtrip(Message {
            transaction_id: 11,
            version: Some(VERSION),
            message_type: MessageType::Response(ResponseSpecific::Announce(
                AnnounceResponseArguments {
                    responder_id: Id::random(),
                    accepted: true,
                },
            )),
        });
    }

    #[test]
    fn test_error() {
        roundtrip(Message {
            transaction_id: 11,
            version: None,
            message_type: MessageType::Error(ErrorSpecific {
                code: ERROR_PROTOCOL,
                description: "Bad token".to_string(),
            }),
        });
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(Message::from_bytes(b"").is_err());
        assert!(Message::from_bytes(b"not bencode").is_err());
        assert!(Message::from_bytes(b"d1:t2:aa1:y1:qe").is_err());

        // Nodes field with a truncated entry.
        let mut bytes = b"d1:rd2:id20:".to_vec();
        bytes.extend([0; 20]);
        bytes.extend(b"5:nodes3:abc5:token1:xe1:t4:\0\0\0\x011:y1:re");
        assert!(Message::from_bytes(&bytes).is_err());
    }
}
