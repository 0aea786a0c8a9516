//! Answering queries from other nodes.

pub mod peers;
pub mod request;
pub mod tokens;

use std::net::SocketAddrV4;
use std::num::NonZeroUsize;

use crate::common::{RequestSpecific, RoutingTable};

pub use peers::*;
pub use tokens::*;

use super::{config::Config, socket::KrpcSocket};

#[derive(Debug)]
/// State needed to answer queries, announce tokens and announced peers.
pub struct Server {
    tokens: Tokens,
    peers: PeersStore,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Server {
            tokens: Tokens::new(config.token_rotation),
            peers: PeersStore::new(
                NonZeroUsize::new(config.max_info_hashes).unwrap_or(NonZeroUsize::MIN),
                NonZeroUsize::new(config.max_peers_per_info_hash).unwrap_or(NonZeroUsize::MIN),
                config.peer_ttl,
            ),
        }
    }

    // === Public Methods ===

    /// Answer a query, see [request::handle_request].
    pub fn handle_request(
        &mut self,
        table: &mut RoutingTable,
        socket: &mut KrpcSocket,
        from: SocketAddrV4,
        transaction_id: Vec<u8>,
        request: RequestSpecific,
    ) {
        request::handle_request(self, table, socket, from, transaction_id, request)
    }

    /// Rotate token secrets when due.
    pub fn tick(&mut self) {
        if self.tokens.should_update() {
            self.tokens.rotate();
        }
    }
}
