use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{AnnouncePeerRequestArguments, Id, Node, RequestTypeSpecific};

use super::closest_nodes::ClosestNodes;
use super::connection::{Connections, Requester, TransactionResult};
use super::socket::KrpcSocket;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of announcing a peer to the closest nodes of an info hash.
pub struct AnnounceResult {
    pub info_hash: Id,
    /// Nodes that acknowledged the announcement.
    pub stored_at: Vec<Node>,
    /// Number of nodes that answered with an error or timed out.
    pub failed: usize,
}

#[derive(Debug)]
/// Once the get_peers traversal of an info hash is done, sends `announce_peer`
/// to its closest responding nodes, each with the token it gave us, and keeps
/// track of the acknowledging nodes.
pub(crate) struct AnnounceQuery {
    id: u64,
    info_hash: Id,
    port: Option<u16>,
    inflight: HashMap<SocketAddrV4, Node>,
    stored_at: Vec<Node>,
    failed: usize,
}

impl AnnounceQuery {
    /// `port: None` announces the source port of our UDP socket.
    pub fn new(id: u64, info_hash: Id, port: Option<u16>) -> Self {
        Self {
            id,
            info_hash,
            port,
            inflight: HashMap::new(),
            stored_at: Vec::new(),
            failed: 0,
        }
    }

    pub fn start(
        &mut self,
        connections: &mut Connections,
        socket: &mut KrpcSocket,
        closest: &ClosestNodes,
        now: Instant,
    ) {
        for responding in closest.nodes() {
            if let Some(token) = responding.token.clone() {
                let node = responding.node;

                connections.query_at(
                    socket,
                    node.into(),
                    RequestTypeSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                        info_hash: self.info_hash,
                        port: self.port.unwrap_or_else(|| socket.local_addr().port()),
                        implied_port: if self.port.is_none() { Some(true) } else { None },
                        token,
                    }),
                    Requester::Announce { announce: self.id },
                    now,
                );

                self.inflight.insert(node.address, node);
            }
        }

        trace!(info_hash = ?self.info_hash, nodes = self.inflight.len(), "Announcing peer");
    }

    pub fn complete(&mut self, from: SocketAddrV4, result: TransactionResult) {
        if let Some(node) = self.inflight.remove(&from) {
            match result {
                TransactionResult::Response(_) => self.stored_at.push(node),
                TransactionResult::Error(error) => {
                    debug!(info_hash = ?self.info_hash, ?from, ?error, "announce_peer rejected");
                    self.failed += 1;
                }
                TransactionResult::Timeout => self.failed += 1,
            }
        }
    }

    /// Every announce_peer request got a response or timed out.
    pub fn is_done(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn result(self) -> AnnounceResult {
        debug!(
            info_hash = ?self.info_hash,
            stored_at = self.stored_at.len(),
            failed = self.failed,
            "Announce done"
        );

        AnnounceResult {
            info_hash: self.info_hash,
            stored_at: self.stored_at,
            failed: self.failed,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::common::{ErrorSpecific, ResponseSpecific};
    use crate::rpc::config::Config;

    #[test]
    fn announce_to_token_bearing_nodes() {
        let own_id = Id::random();
        let (sender, _receiver) = flume::unbounded();
        let mut connections = Connections::new(own_id, Duration::from_secs(10), sender);
        let mut socket = KrpcSocket::new(&Config {
            port: Some(0),
            ..Default::default()
        })
        .unwrap();

        let info_hash = Id::random();
        let mut closest = ClosestNodes::new(info_hash);

        let nodes: Vec<Node> = (1..=3)
            .map(|i| Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), i)))
            .collect();

        closest.add(nodes[0], Some(vec![1]));
        closest.add(nodes[1], Some(vec![2]));
        closest.add(nodes[2], None);

        let mut announce = AnnounceQuery::new(7, info_hash, Some(6881));
        announce.start(&mut connections, &mut socket, &closest, Instant::now());

        assert!(!announce.is_done());
        assert_eq!(connections.len(), 2);

        announce.complete(
            nodes[0].address,
            TransactionResult::Response(ResponseSpecific::empty(nodes[0].id)),
        );
        // Unexpected address.
        announce.complete(
            nodes[2].address,
            TransactionResult::Response(ResponseSpecific::empty(nodes[2].id)),
        );
        assert!(!announce.is_done());

        announce.complete(
            nodes[1].address,
            TransactionResult::Error(ErrorSpecific::with_description(203, "Invalid Token")),
        );
        assert!(announce.is_done());

        assert_eq!(
            announce.result(),
            AnnounceResult {
                info_hash,
                stored_at: vec![nodes[0]],
                failed: 1,
            }
        );
    }
}
