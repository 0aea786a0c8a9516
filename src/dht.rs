//! Dht node.

use std::{
    collections::HashMap,
    net::SocketAddrV4,
    thread,
    time::Duration,
};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::{
    common::{Contact, Id, RoutingTable},
    rpc::{AnnounceResult, Config, Info, Rpc, TraversalError},
};

#[derive(Debug, Clone)]
/// Kademlia node speaking the BitTorrent DHT protocol.
///
/// Cheap to clone, every clone talks to the same actor thread, which stops
/// when [Dht::shutdown] is called or every clone is dropped.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default, Clone)]
/// A builder for [Dht]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes, as `host:port` strings.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    /// Set an explicit node id.
    pub fn id(&mut self, id: Id) -> &mut Self {
        self.0.id = Some(id);

        self
    }

    /// Set the protocol timeout of a single query.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the duration after which a traversal moves on from a slow node.
    pub fn short_timeout(&mut self, short_timeout: Duration) -> &mut Self {
        self.0.short_timeout = short_timeout;

        self
    }

    /// Set the duration a converged traversal waits for late results.
    pub fn traversal_grace(&mut self, traversal_grace: Duration) -> &mut Self {
        self.0.traversal_grace = traversal_grace;

        self
    }

    /// Set the interval between announce token secret rotations.
    pub fn token_rotation(&mut self, token_rotation: Duration) -> &mut Self {
        self.0.token_rotation = token_rotation;

        self
    }

    /// Set the duration an announced peer is kept.
    pub fn peer_ttl(&mut self, peer_ttl: Duration) -> &mut Self {
        self.0.peer_ttl = peer_ttl;

        self
    }

    /// Set the maximum number of info hashes in the peers store.
    pub fn max_info_hashes(&mut self, max_info_hashes: usize) -> &mut Self {
        self.0.max_info_hashes = max_info_hashes;

        self
    }

    /// Set the maximum number of peers per info hash in the peers store.
    pub fn max_peers_per_info_hash(&mut self, max_peers_per_info_hash: usize) -> &mut Self {
        self.0.max_peers_per_info_hash = max_peers_per_info_hash;

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        Dht::new(self.0.clone())
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Could return an error if it failed to bind to the specified
    /// port or other io errors while binding the udp socket.
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let rpc = Rpc::new(config)?;

        let address = rpc.local_addr();
        info!(?address, "Kadht listening");

        thread::Builder::new()
            .name("kadht".to_string())
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht(sender))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node with default settings.
    pub fn client() -> Result<Self, std::io::Error> {
        Dht::builder().build()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTable>(1);

        self.0
            .send(ActorMessage::RoutingTable(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<String>>(1);

        self.0
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Populate the routing table by walking toward our own id, starting at `contacts`,
    /// or at the configured bootstrap nodes if `contacts` is empty.
    ///
    /// Blocks until the traversal is done, and returns the routing table size.
    pub fn bootstrap(&self, contacts: &[Contact]) -> Result<usize, DhtTraversalError> {
        let (sender, receiver) = flume::bounded::<Result<usize, TraversalError>>(1);

        self.0
            .send(ActorMessage::Bootstrap(contacts.to_vec(), sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    /// Look up peers announced for an info hash.
    ///
    /// The returned iterator yields new peers as they are found, then
    /// every found peer once more in a final response with `finished == true`.
    pub fn lookup(&self, info_hash: Id) -> Result<Lookup, DhtTraversalError> {
        let (started, responses) = self.start_lookup(info_hash)?;

        started.recv().map_err(|_| DhtWasShutdown)??;

        Ok(Lookup(responses))
    }

    /// Announce this node as a peer for an info hash, to the closest nodes
    /// found by a [Dht::lookup].
    ///
    /// If `port` is `None`, remote nodes record the source port of our UDP socket.
    pub fn announce(
        &self,
        info_hash: Id,
        port: Option<u16>,
    ) -> Result<AnnounceResult, DhtTraversalError> {
        let (sender, receiver) = flume::bounded::<Result<AnnounceResult, TraversalError>>(1);

        self.0
            .send(ActorMessage::Announce(info_hash, port, sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver.recv().map_err(|_| DhtWasShutdown)??)
    }

    // === Private Methods ===

    pub(crate) fn start_lookup(
        &self,
        info_hash: Id,
    ) -> Result<LookupChannels, DhtWasShutdown> {
        let (started_sender, started) = flume::bounded::<Result<(), TraversalError>>(1);
        // Unbounded so the actor never blocks on a slow consumer.
        let (responses_sender, responses) = flume::unbounded::<LookupResponse>();

        self.0
            .send(ActorMessage::Lookup(info_hash, started_sender, responses_sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok((started, responses))
    }
}

pub(crate) type LookupChannels = (
    Receiver<Result<(), TraversalError>>,
    Receiver<LookupResponse>,
);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Peers found by a [Dht::lookup].
pub struct LookupResponse {
    /// New peers, or all found peers if `finished` is true.
    pub peers: Vec<SocketAddrV4>,
    /// True for the last response of a lookup.
    pub finished: bool,
}

#[derive(Debug)]
/// Iterator over the responses of a [Dht::lookup].
pub struct Lookup(Receiver<LookupResponse>);

impl Iterator for Lookup {
    type Item = LookupResponse;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.recv().ok()
    }
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    let mut pending: HashMap<u64, Pending> = HashMap::new();

    loop {
        match receiver.try_recv() {
            Ok(actor_message) => match actor_message {
                ActorMessage::Shutdown(sender) => {
                    drop(receiver);
                    let _ = sender.send(());
                    break;
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send(rpc.info());
                }
                ActorMessage::RoutingTable(sender) => {
                    let _ = sender.send(rpc.routing_table().clone());
                }
                ActorMessage::ToBootstrap(sender) => {
                    let _ = sender.send(rpc.routing_table().to_bootstrap());
                }
                ActorMessage::Bootstrap(contacts, sender) => match rpc.bootstrap(&contacts) {
                    Ok(id) => {
                        pending.insert(id, Pending::Bootstrap(sender));
                    }
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                },
                ActorMessage::Lookup(info_hash, started, responses) => {
                    match rpc.lookup(info_hash) {
                        Ok(id) => {
                            let _ = started.send(Ok(()));
                            pending.insert(id, Pending::Lookup(responses));
                        }
                        Err(error) => {
                            let _ = started.send(Err(error));
                        }
                    }
                }
                ActorMessage::Announce(info_hash, port, sender) => {
                    match rpc.announce(info_hash, port) {
                        Ok(id) => {
                            pending.insert(id, Pending::Announce(sender));
                        }
                        Err(error) => {
                            let _ = sender.send(Err(error));
                        }
                    }
                }
            },
            Err(TryRecvError::Disconnected) => {
                debug!("kadht::Dht's actor thread was shutdown after Drop.");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        let report = rpc.tick();

        for (id, peers) in report.new_peers {
            if let Some(Pending::Lookup(sender)) = pending.get(&id) {
                let _ = sender.send(LookupResponse {
                    peers,
                    finished: false,
                });
            }
        }

        for done in report.done_traversals {
            // Announces are answered once announced.
            if let Some(Pending::Announce(_)) = pending.get(&done.id) {
                continue;
            }

            match pending.remove(&done.id) {
                Some(Pending::Bootstrap(sender)) => {
                    let _ = sender.send(Ok(rpc.routing_table().size()));
                }
                Some(Pending::Lookup(sender)) => {
                    let _ = sender.send(LookupResponse {
                        peers: done.peers,
                        finished: true,
                    });
                }
                _ => {}
            }
        }

        for (id, result) in report.done_announces {
            if let Some(Pending::Announce(sender)) = pending.remove(&id) {
                let _ = sender.send(Ok(result));
            }
        }
    }
}

/// Callers waiting for a traversal to be done.
#[derive(Debug)]
enum Pending {
    Bootstrap(Sender<Result<usize, TraversalError>>),
    Lookup(Sender<LookupResponse>),
    Announce(Sender<Result<AnnounceResult, TraversalError>>),
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    RoutingTable(Sender<RoutingTable>),
    ToBootstrap(Sender<Vec<String>>),
    Bootstrap(Vec<Contact>, Sender<Result<usize, TraversalError>>),
    Lookup(
        Id,
        Sender<Result<(), TraversalError>>,
        Sender<LookupResponse>,
    ),
    Announce(
        Id,
        Option<u16>,
        Sender<Result<AnnounceResult, TraversalError>>,
    ),
    Shutdown(Sender<()>),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The actor thread is no longer running.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors of [Dht::bootstrap], [Dht::lookup] and [Dht::announce].
pub enum DhtTraversalError {
    #[error(transparent)]
    Traversal(#[from] TraversalError),

    #[error(transparent)]
    DhtWasShutdown(#[from] DhtWasShutdown),
}
