//! End to end tests running several nodes on the loopback interface.

use std::{
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
    time::Duration,
};

use kadht::{
    messages::{
        AnnouncePeerRequestArguments, GetPeersRequestArguments, Message, MessageType,
        RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    },
    Contact, Dht, Id,
};

fn node() -> Dht {
    Dht::builder()
        .port(0)
        .short_timeout(Duration::from_millis(200))
        .traversal_grace(Duration::from_millis(200))
        .build()
        .unwrap()
}

fn contact(dht: &Dht) -> Contact {
    let port = dht.info().unwrap().local_addr().port();

    Contact::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[test]
fn bootstrap_from_another_node() {
    let a = node();
    let b = node();

    let size = a.bootstrap(&[contact(&b)]).unwrap();

    let b_id = *b.info().unwrap().id();

    assert_eq!(size, 1);
    assert!(a.routing_table().unwrap().contains(&b_id));
    assert_eq!(a.info().unwrap().running_traversals(), 0);
}

#[test]
fn lookup_finishes_once() {
    let a = node();
    let b = node();

    a.bootstrap(&[contact(&b)]).unwrap();

    let responses: Vec<_> = a.lookup(Id::random()).unwrap().collect();

    assert_eq!(responses.iter().filter(|r| r.finished).count(), 1);
    assert!(responses.last().unwrap().finished);
    assert!(responses.last().unwrap().peers.is_empty());
}

#[test]
fn announce_then_lookup() {
    let a = node();
    let b = node();
    let c = node();

    a.bootstrap(&[contact(&b)]).unwrap();
    c.bootstrap(&[contact(&b)]).unwrap();

    let info_hash = Id::random();

    let result = a.announce(info_hash, Some(4000)).unwrap();

    assert_eq!(result.info_hash, info_hash);
    assert!(result
        .stored_at
        .iter()
        .any(|node| &node.id == b.info().unwrap().id()));

    let responses: Vec<_> = c.lookup(info_hash).unwrap().collect();
    let last = responses.last().unwrap();

    assert!(last.finished);
    assert_eq!(
        last.peers,
        vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000)]
    );
}

struct RawClient {
    socket: UdpSocket,
    id: Id,
    remote: SocketAddrV4,
}

impl RawClient {
    fn new(dht: &Dht) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        RawClient {
            socket,
            id: Id::random(),
            remote: contact(dht).address,
        }
    }

    fn send_bytes(&self, bytes: &[u8]) -> Message {
        self.socket.send_to(bytes, self.remote).unwrap();

        let mut buf = [0u8; 2048];
        let (amt, _) = self.socket.recv_from(&mut buf).unwrap();

        Message::from_bytes(&buf[..amt]).unwrap()
    }

    fn request(&self, transaction_id: &[u8], request_type: RequestTypeSpecific) -> Message {
        let message = Message {
            transaction_id: transaction_id.to_vec(),
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: self.id,
                request_type,
            }),
        };

        self.send_bytes(&message.to_bytes().unwrap())
    }
}

#[test]
fn malformed_target_gets_protocol_error() {
    let dht = node();
    let client = RawClient::new(&dht);

    let mut bytes = b"d1:ad2:id20:".to_vec();
    bytes.extend_from_slice(client.id.as_bytes());
    bytes.extend_from_slice(b"6:target19:");
    bytes.extend_from_slice(&[7u8; 19]);
    bytes.extend_from_slice(b"e1:q9:find_node1:t2:aa1:y1:qe");

    let reply = client.send_bytes(&bytes);

    assert_eq!(reply.transaction_id, b"aa".to_vec());
    match reply.message_type {
        MessageType::Error(error) => assert_eq!(error.code, 203),
        other => panic!("expected an error reply, got {:?}", other),
    }
}

#[test]
fn argument_of_the_wrong_type_gets_protocol_error() {
    let dht = node();
    let client = RawClient::new(&dht);

    let mut bytes = b"d1:ad2:id20:".to_vec();
    bytes.extend_from_slice(client.id.as_bytes());
    bytes.extend_from_slice(b"6:targeti5ee1:q9:find_node1:t2:bb1:y1:qe");

    let reply = client.send_bytes(&bytes);

    assert_eq!(reply.transaction_id, b"bb".to_vec());
    match reply.message_type {
        MessageType::Error(error) => assert_eq!(error.code, 203),
        other => panic!("expected an error reply, got {:?}", other),
    }
}

#[test]
fn announce_peer_checks_the_token() {
    let dht = node();
    let client = RawClient::new(&dht);
    let info_hash = Id::random();

    let token = match client
        .request(
            b"t1",
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }),
        )
        .message_type
    {
        MessageType::Response(ResponseSpecific {
            token: Some(token),
            values,
            ..
        }) => {
            assert_eq!(values, None);
            token
        }
        other => panic!("expected a response with a token, got {:?}", other),
    };

    let bogus = client.request(
        b"t2",
        RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
            info_hash,
            port: 5000,
            implied_port: None,
            token: b"bogus".to_vec(),
        }),
    );

    match bogus.message_type {
        MessageType::Error(error) => {
            assert_eq!(error.code, 203);
            assert_eq!(error.description, "Invalid Token");
        }
        other => panic!("expected an error reply, got {:?}", other),
    }

    let valid = client.request(
        b"t3",
        RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
            info_hash,
            port: 5000,
            implied_port: None,
            token,
        }),
    );

    assert!(matches!(valid.message_type, MessageType::Response(_)));

    match client
        .request(
            b"t4",
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }),
        )
        .message_type
    {
        MessageType::Response(response) => assert_eq!(
            response.values,
            Some(vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000)])
        ),
        other => panic!("expected a response, got {:?}", other),
    }
}
