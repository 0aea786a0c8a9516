//! Request handlers

use std::net::SocketAddrV4;

use tracing::debug;

use crate::common::{
    AnnouncePeerRequestArguments, ErrorSpecific, FindNodeRequestArguments,
    GetPeersRequestArguments, Node, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    RoutingTable, ERROR_PROTOCOL,
};

use super::{super::socket::KrpcSocket, Server};

pub fn handle_request(
    server: &mut Server,
    table: &mut RoutingTable,
    socket: &mut KrpcSocket,
    from: SocketAddrV4,
    transaction_id: Vec<u8>,
    request: RequestSpecific,
) {
    let own_id = *table.id();
    let requester_id = request.requester_id;

    match request.request_type {
        RequestTypeSpecific::Ping => {
            socket.response(from, transaction_id, ResponseSpecific::empty(own_id));
        }
        RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
            socket.response(
                from,
                transaction_id,
                ResponseSpecific {
                    nodes: Some(table.closest(&target)),
                    ..ResponseSpecific::empty(own_id)
                },
            );
        }
        RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
            let peers = server.peers.get_random_peers(&info_hash);

            socket.response(
                from,
                transaction_id,
                ResponseSpecific {
                    responder_id: own_id,
                    nodes: Some(table.closest(&info_hash)),
                    values: if peers.is_empty() { None } else { Some(peers) },
                    token: Some(server.tokens.generate_token(from).to_vec()),
                },
            );
        }
        RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
            info_hash,
            port,
            implied_port,
            token,
        }) => {
            if !server.tokens.validate(from, &token) {
                debug!(
                    ?info_hash,
                    ?requester_id,
                    ?from,
                    ?token,
                    request_type = "announce_peer",
                    "Invalid token"
                );

                socket.error(
                    from,
                    transaction_id,
                    ErrorSpecific::with_description(ERROR_PROTOCOL, "Invalid Token"),
                );
                return;
            }

            let peer = match implied_port {
                Some(true) => from,
                _ => SocketAddrV4::new(*from.ip(), port),
            };

            server.peers.add_peer(info_hash, peer);
            table.node_seen(Node::new(requester_id, from));

            socket.response(from, transaction_id, ResponseSpecific::empty(own_id));
        }
    }
}
