use std::time::Duration;

use crate::common::Id;

use super::{
    server::DEFAULT_TOKEN_ROTATION, DEFAULT_MAX_INFO_HASHES, DEFAULT_MAX_PEERS_PER_INFO_HASH,
    DEFAULT_PEER_TTL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHORT_TIMEOUT, DEFAULT_TRAVERSAL_GRACE,
};

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes as `host:port` strings, resolved whenever
    /// [crate::Dht::bootstrap] is called without explicit contacts.
    ///
    /// Defaults to an empty list.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where `6881` is tried first, then any port the OS assigns.
    pub port: Option<u16>,
    /// Explicit Id for this node.
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Duration after which an unanswered query fails, and its contact is
    /// marked as failing in the routing table.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Duration after which a traversal stops waiting for a slow node and
    /// moves on, while still accepting its late response.
    ///
    /// Defaults to [DEFAULT_SHORT_TIMEOUT]
    pub short_timeout: Duration,
    /// Duration a converged traversal waits for late responses before it is done.
    ///
    /// Defaults to [DEFAULT_TRAVERSAL_GRACE]
    pub traversal_grace: Duration,
    /// Interval between announce token secret rotations.
    ///
    /// Defaults to [DEFAULT_TOKEN_ROTATION]
    pub token_rotation: Duration,
    /// Duration an announced peer is kept unless announced again.
    ///
    /// Defaults to [DEFAULT_PEER_TTL]
    pub peer_ttl: Duration,
    /// Maximum number of info hashes in the peers store.
    ///
    /// Defaults to [DEFAULT_MAX_INFO_HASHES]
    pub max_info_hashes: usize,
    /// Maximum number of peers stored per info hash.
    ///
    /// Defaults to [DEFAULT_MAX_PEERS_PER_INFO_HASH]
    pub max_peers_per_info_hash: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            short_timeout: DEFAULT_SHORT_TIMEOUT,
            traversal_grace: DEFAULT_TRAVERSAL_GRACE,
            token_rotation: DEFAULT_TOKEN_ROTATION,
            peer_ttl: DEFAULT_PEER_TTL,
            max_info_hashes: DEFAULT_MAX_INFO_HASHES,
            max_peers_per_info_hash: DEFAULT_MAX_PEERS_PER_INFO_HASH,
        }
    }
}
