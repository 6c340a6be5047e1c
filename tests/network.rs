//! End to end tests on localhost nodes.

use std::cmp::Ordering;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kadnode::{
    messages::{
        AnnounceRequestArguments, Message, MessageType, RequestSpecific, RequestTypeSpecific,
        ERROR_PROTOCOL,
    },
    compare_by_distance, distance, Error, Id, NodeStatus, Testnet, Value, ValuePayload,
    TEXT_PLAIN,
};

fn request(socket: &UdpSocket, to: SocketAddr, request: RequestSpecific) -> Message {
    let message = Message {
        transaction_id: 42,
        version: None,
        message_type: MessageType::Request(request),
    };

    socket.send_to(&message.to_bytes().unwrap(), to).unwrap();

    let mut buf = [0u8; 2048];
    let (amt, from) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(from, to);

    Message::from_bytes(&buf[..amt]).unwrap()
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

#[test]
fn three_nodes() {
    let c = Testnet::builder().build().unwrap();
    let b = Testnet::builder()
        .bootstrap(&[c.local_addr().to_string()])
        .build()
        .unwrap();
    assert!(b.bootstrapped().unwrap());

    let a = Testnet::builder()
        .bootstrap(&[b.local_addr().to_string()])
        .build()
        .unwrap();
    assert!(a.bootstrapped().unwrap());

    let nodes = a.find_node(*c.id()).unwrap();
    assert_eq!(nodes.first().map(|node| node.id()), Some(c.id()));
    assert!(distance(nodes[0].id(), c.id()).is_zero());
    assert!(nodes.windows(2).all(|pair| {
        compare_by_distance(c.id(), pair[0].id(), pair[1].id()) == Ordering::Less
    }));

    a.put("k", &b"v"[..], TEXT_PLAIN).unwrap();

    let values = c.get("k", None).unwrap().collect::<Vec<_>>();

    assert_eq!(values.len(), 1);
    assert_eq!(values[0].payload(), ValuePayload::Text("v".to_string()));
}

#[test]
fn lonely_node_is_not_bootstrapped() {
    let dht = Testnet::builder().build().unwrap();

    assert!(matches!(
        dht.find_node(Id::random()),
        Err(Error::NotBootstrapped)
    ));

    let stream = dht.get("k", None).unwrap();
    assert!(matches!(stream.finish(), Err(Error::NotBootstrapped)));

    assert!(matches!(
        dht.put("k", &b"v"[..], TEXT_PLAIN),
        Err(Error::NotBootstrapped)
    ));
}

#[test]
fn silent_bootstrap_fails() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

    let dht = Testnet::builder()
        .bootstrap(&[silent.local_addr().unwrap().to_string()])
        .build()
        .unwrap();

    assert!(!dht.bootstrapped().unwrap());
    assert_eq!(dht.info().unwrap().routing_table_size(), 0);
}

#[test]
fn forged_token_is_rejected() {
    let dht = Testnet::builder().build().unwrap();
    let socket = client();

    let response = request(
        &socket,
        dht.local_addr(),
        RequestSpecific {
            requester_id: Id::random(),
            request_type: RequestTypeSpecific::Announce(AnnounceRequestArguments {
                key: Id::from_key("k"),
                token: vec![0, 1, 2, 3].into(),
                value: Value::text("forged", Duration::from_secs(60)),
            }),
        },
    );

    match response.message_type {
        MessageType::Error(error) => assert_eq!(error.code, ERROR_PROTOCOL),
        other => panic!("expected an error, got {other:?}"),
    }

    assert_eq!(dht.info().unwrap().stored_values(), 0);
}

#[test]
fn malformed_datagrams_are_ignored() {
    let dht = Testnet::builder().build().unwrap();
    let socket = client();

    socket.send_to(b"not bencode", dht.local_addr()).unwrap();
    socket.send_to(b"d1:y1:qe", dht.local_addr()).unwrap();
    socket.send_to(&[0xff; 600], dht.local_addr()).unwrap();

    let requester_id = Id::random();
    let response = request(
        &socket,
        dht.local_addr(),
        RequestSpecific {
            requester_id,
            request_type: RequestTypeSpecific::Ping,
        },
    );

    assert_eq!(response.transaction_id, 42);
    assert_eq!(response.get_author_id(), Some(*dht.id()));
}

#[test]
fn status_changes_are_reported_once() {
    let testnet = Testnet::new(2).unwrap();
    let dht = Testnet::builder().build().unwrap();

    let changes = Arc::new(Mutex::new(vec![]));
    let (sender, receiver) = flume::unbounded();

    let recorded = changes.clone();
    dht.on_status_changed(move |ipv4, ipv6| {
        recorded.lock().unwrap().push((ipv4, ipv6));
        let _ = sender.send(ipv4);
    })
    .unwrap();

    let address = testnet.nodes[0].local_addr();
    dht.bootstrap(&address.ip().to_string(), address.port())
        .unwrap();
    assert!(dht.bootstrapped().unwrap());

    let mut connected = false;
    while let Ok(ipv4) = receiver.recv_timeout(Duration::from_secs(5)) {
        if ipv4 == NodeStatus::Connected {
            connected = true;
            break;
        }
    }
    assert!(connected);

    let changes = changes.lock().unwrap();
    assert!(changes.windows(2).all(|pair| pair[0] != pair[1]));
    assert!(changes
        .iter()
        .all(|(_, ipv6)| *ipv6 == NodeStatus::Disconnected));
}

#[test]
fn several_large_values_under_one_key() {
    let testnet = Testnet::new(3).unwrap();
    let key = Id::from_key("big");

    for byte in 0..3u8 {
        let value = Value::new(vec![byte; 900], "application/octet-stream", Duration::from_secs(600));
        testnet.nodes[1].put_value(key, value).unwrap();
    }

    let reader = Testnet::builder()
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();
    assert!(reader.bootstrapped().unwrap());

    let values = reader.get("big", None).unwrap().collect::<Vec<_>>();

    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|value| value.data().len() == 900));
}

#[test]
fn values_survive_the_putting_node() {
    let testnet = Testnet::new(4).unwrap();

    let writer = Testnet::builder()
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();
    writer.bootstrapped().unwrap();

    writer.put("durable", &b"still here"[..], TEXT_PLAIN).unwrap();
    writer.shutdown();

    let values = testnet.nodes[3]
        .get("durable", None)
        .unwrap()
        .collect::<Vec<_>>();

    assert_eq!(
        values.first().map(|value| value.payload()),
        Some(ValuePayload::Text("still here".to_string()))
    );
}

#[test]
fn join_returns_after_shutdown() {
    let dht = Testnet::builder().build().unwrap();

    let handle = {
        let dht = dht.clone();
        std::thread::spawn(move || dht.join())
    };

    dht.shutdown();
    handle.join().unwrap();

    assert!(matches!(dht.info(), Err(Error::Shutdown)));
}
