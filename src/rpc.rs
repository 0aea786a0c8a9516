//! K-RPC implementation.

mod announce;
mod closest_nodes;
pub mod config;
mod connection;
mod info;
mod maintenance;
pub mod server;
mod socket;
mod traversal;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, info, warn};

use crate::common::{Contact, Id, Message, MessageError, MessageType, Node, RoutingTable};

pub use announce::AnnounceResult;
pub use config::Config;
pub use info::Info;
pub use socket::DEFAULT_PORT;
pub use traversal::{Budget, TraversalError, TraversalKind, ALPHA, DEFAULT_MAX_REQUESTS};

use announce::AnnounceQuery;
use connection::{Completion, Connections, Requester};
use maintenance::RoutingMaintenance;
use server::Server;
use socket::KrpcSocket;
use traversal::Traversal;

/// Default protocol timeout of a single query.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default duration after which a traversal moves on from a slow node.
pub const DEFAULT_SHORT_TIMEOUT: Duration = Duration::from_secs(2);
/// Default duration a converged traversal waits for late results.
pub const DEFAULT_TRAVERSAL_GRACE: Duration = Duration::from_secs(5);
/// Default duration an announced peer is kept.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(30 * 60);
/// Default maximum number of info hashes in the peers store.
pub const DEFAULT_MAX_INFO_HASHES: usize = 2000;
/// Default maximum number of peers per info hash in the peers store.
pub const DEFAULT_MAX_PEERS_PER_INFO_HASH: usize = 500;

/// Extra requests a peer lookup may send on top of [DEFAULT_MAX_REQUESTS].
const LOOKUP_EXTRA_REQUESTS: usize = 100;

#[derive(Debug)]
/// Internal Rpc called in the Dht thread loop, useful to create your own actor setup.
///
/// Owns the routing table, the connections and every running traversal.
pub struct Rpc {
    socket: KrpcSocket,
    routing_table: RoutingTable,
    connections: Connections,
    completions: Receiver<Completion>,
    server: Server,
    maintenance: RoutingMaintenance,

    traversals: HashMap<u64, Traversal>,
    /// Traversals whose closest nodes get announced to once done, and the announced port.
    announcing: HashMap<u64, Option<u16>>,
    announces: HashMap<u64, AnnounceQuery>,
    next_id: u64,

    config: Config,
}

#[derive(Debug, Default)]
/// What happened during a single [Rpc::tick].
pub struct RpcTickReport {
    /// Peers found since the previous tick, per traversal id.
    pub new_peers: Vec<(u64, Vec<SocketAddrV4>)>,
    /// Traversals that are done.
    pub done_traversals: Vec<DoneTraversal>,
    /// Announces that are done, by the id returned from [Rpc::announce].
    pub done_announces: Vec<(u64, AnnounceResult)>,
}

#[derive(Debug, Clone)]
/// A traversal that is done, and what it found.
pub struct DoneTraversal {
    pub id: u64,
    pub target: Id,
    pub kind: TraversalKind,
    /// Every distinct peer found.
    pub peers: Vec<SocketAddrV4>,
    /// Closest nodes that responded with an announce token.
    pub closest: Vec<Node>,
}

impl Rpc {
    /// Create a new Rpc
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let id = config.id.unwrap_or_else(Id::random);

        let socket = KrpcSocket::new(&config)?;
        let (sender, completions) = flume::unbounded();

        Ok(Rpc {
            socket,
            routing_table: RoutingTable::new(id),
            connections: Connections::new(id, config.request_timeout, sender),
            completions,
            server: Server::new(&config),
            maintenance: RoutingMaintenance::new(),

            traversals: HashMap::new(),
            announcing: HashMap::new(),
            announces: HashMap::new(),
            next_id: 0,

            config,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn running_traversals(&self) -> usize {
        self.traversals.len()
    }

    /// Returns [Info] about this node.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Start a refresh traversal toward our own id, seeded with `contacts`.
    ///
    /// If `contacts` is empty, the configured bootstrap addresses are resolved
    /// and used instead, if any. Returns the traversal id.
    pub fn bootstrap(&mut self, contacts: &[Contact]) -> Result<u64, TraversalError> {
        let contacts = if contacts.is_empty() {
            resolve(&self.config.bootstrap)
        } else {
            contacts.to_vec()
        };

        let target = *self.id();
        let extra = contacts.len();

        self.start_traversal(target, TraversalKind::Refresh, contacts, extra)
    }

    /// Start a peer lookup for an info hash. Returns the traversal id.
    pub fn lookup(&mut self, info_hash: Id) -> Result<u64, TraversalError> {
        self.start_traversal(
            info_hash,
            TraversalKind::GetPeers,
            Vec::new(),
            LOOKUP_EXTRA_REQUESTS,
        )
    }

    /// Start a peer lookup, then announce this node as a peer to the closest
    /// nodes. Returns the id reported in [RpcTickReport::done_announces].
    pub fn announce(&mut self, info_hash: Id, port: Option<u16>) -> Result<u64, TraversalError> {
        let id = self.lookup(info_hash)?;
        self.announcing.insert(id, port);

        Ok(id)
    }

    /// Advance the state of every running query by one step.
    pub fn tick(&mut self) -> RpcTickReport {
        let mut report = RpcTickReport::default();

        if let Some((message, from)) = self.socket.recv_from() {
            self.handle_message(message, from);
        }

        self.connections
            .tick(&mut self.socket, &mut self.routing_table);

        for completion in self.completions.drain() {
            match completion.requester {
                Requester::Traversal { traversal, request } => {
                    if let Some(traversal) = self.traversals.get_mut(&traversal) {
                        traversal.complete(request, completion.result);
                    }
                }
                Requester::Announce { announce } => {
                    if let Some(announce) = self.announces.get_mut(&announce) {
                        announce.complete(completion.from, completion.result);
                    }
                }
            }
        }

        let mut done = Vec::new();

        for (id, traversal) in self.traversals.iter_mut() {
            traversal.tick(
                &mut self.routing_table,
                &mut self.connections,
                &mut self.socket,
            );

            let new_peers = traversal.take_new_peers();
            if !new_peers.is_empty() {
                report.new_peers.push((*id, new_peers));
            }

            if traversal.is_done() {
                done.push(*id);
            }
        }

        for id in done {
            if let Some(traversal) = self.traversals.remove(&id) {
                if let Some(port) = self.announcing.remove(&id) {
                    let mut announce = AnnounceQuery::new(id, traversal.target(), port);
                    announce.start(
                        &mut self.connections,
                        &mut self.socket,
                        traversal.closest(),
                        Instant::now(),
                    );
                    self.announces.insert(id, announce);
                }

                if traversal.kind() == TraversalKind::Refresh && traversal.target() == *self.id()
                {
                    debug!(table_size = self.routing_table.size(), "Refreshed own id");
                }

                report.done_traversals.push(DoneTraversal {
                    id,
                    target: traversal.target(),
                    kind: traversal.kind(),
                    peers: traversal.peers().to_vec(),
                    closest: traversal
                        .closest()
                        .nodes()
                        .iter()
                        .map(|responding| responding.node)
                        .collect(),
                });
            }
        }

        let finished: Vec<u64> = self
            .announces
            .iter()
            .filter(|(_, announce)| announce.is_done())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(announce) = self.announces.remove(&id) {
                report.done_announces.push((id, announce.result()));
            }
        }

        self.server.tick();

        if let Some(target) = self.maintenance.refresh_target(&mut self.routing_table) {
            if let Err(error) =
                self.start_traversal(target, TraversalKind::Refresh, Vec::new(), 0)
            {
                debug!(?target, ?error, "Could not refresh the routing table");
            }
        }

        report
    }

    // === Private Methods ===

    fn start_traversal(
        &mut self,
        target: Id,
        kind: TraversalKind,
        contacts: Vec<Contact>,
        extra_requests: usize,
    ) -> Result<u64, TraversalError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut traversal = Traversal::new(
            id,
            target,
            kind,
            self.config.short_timeout,
            self.config.traversal_grace,
        );
        traversal.add_list(contacts);
        traversal.extend_budget(extra_requests);

        traversal.start(
            &self.routing_table,
            &mut self.connections,
            &mut self.socket,
            Instant::now(),
        )?;

        self.traversals.insert(id, traversal);

        Ok(id)
    }

    fn handle_message(&mut self, message: Result<Message, MessageError>, from: SocketAddrV4) {
        match message {
            Ok(Message {
                transaction_id,
                message_type: MessageType::Request(request),
                ..
            }) => {
                self.server.handle_request(
                    &mut self.routing_table,
                    &mut self.socket,
                    from,
                    transaction_id,
                    request,
                );
            }
            Ok(message) => {
                self.connections.receive(
                    &mut self.socket,
                    &mut self.routing_table,
                    from,
                    message,
                );
            }
            Err(MessageError::InvalidResponderId { transaction_id }) => {
                self.connections
                    .invalid_response(&mut self.routing_table, from, &transaction_id);
            }
            Err(error) => {
                if let Some((transaction_id, reply)) = error.to_error_reply() {
                    debug!(?from, ?error, "Replying to an invalid query");
                    self.socket.error(from, transaction_id.to_vec(), reply);
                }
            }
        }
    }
}

/// Resolve `host:port` strings to Ipv4 contacts.
fn resolve(addresses: &[String]) -> Vec<Contact> {
    let mut contacts = Vec::new();

    for address in addresses {
        match address.to_socket_addrs() {
            Ok(resolved) => {
                for address in resolved {
                    if let SocketAddr::V4(address) = address {
                        contacts.push(Contact::new(address));
                    }
                }
            }
            Err(error) => warn!(?address, ?error, "Could not resolve bootstrap address"),
        }
    }

    if contacts.is_empty() && !addresses.is_empty() {
        info!("None of the bootstrap addresses could be resolved");
    }

    contacts
}
