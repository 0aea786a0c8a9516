//! Manage announced peers for info_hashes

use std::{
    net::SocketAddrV4,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use rand::{seq::IteratorRandom, thread_rng};

use crate::common::Id;

/// Maximum number of peers returned in a single get_peers response.
pub const MAX_RETURNED_PEERS: usize = 50;

#[derive(Debug)]
/// An LRU cache of announced peers per info hash, with per-peer expiry.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct PeersStore {
    info_hashes: LruCache<Id, LruCache<SocketAddrV4, Instant>>,
    max_peers: NonZeroUsize,
    ttl: Duration,
}

impl PeersStore {
    pub fn new(max_info_hashes: NonZeroUsize, max_peers: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            info_hashes: LruCache::new(max_info_hashes),
            max_peers,
            ttl,
        }
    }

    /// Add or refresh a peer for an info hash.
    pub fn add_peer(&mut self, info_hash: Id, peer: SocketAddrV4) {
        self.add_peer_at(info_hash, peer, Instant::now())
    }

    /// Up to [MAX_RETURNED_PEERS] random, unexpired peers for an info hash.
    pub fn get_random_peers(&mut self, info_hash: &Id) -> Vec<SocketAddrV4> {
        self.get_random_peers_at(info_hash, Instant::now())
    }

    pub(crate) fn add_peer_at(&mut self, info_hash: Id, peer: SocketAddrV4, now: Instant) {
        if let Some(peers) = self.info_hashes.get_mut(&info_hash) {
            peers.put(peer, now);
        } else {
            let mut peers = LruCache::new(self.max_peers);
            peers.put(peer, now);
            self.info_hashes.put(info_hash, peers);
        };
    }

    pub(crate) fn get_random_peers_at(&mut self, info_hash: &Id, now: Instant) -> Vec<SocketAddrV4> {
        let ttl = self.ttl;

        let peers = match self.info_hashes.get_mut(info_hash) {
            Some(peers) => peers,
            None => return Vec::new(),
        };

        // Least recently announced peers are at the end of the LRU.
        while let Some((_, announced_at)) = peers.peek_lru() {
            if now.saturating_duration_since(*announced_at) < ttl {
                break;
            }
            peers.pop_lru();
        }

        if peers.is_empty() {
            self.info_hashes.pop(info_hash);
            return Vec::new();
        }

        peers
            .iter()
            .map(|(peer, _)| *peer)
            .choose_multiple(&mut thread_rng(), MAX_RETURNED_PEERS)
    }
}
