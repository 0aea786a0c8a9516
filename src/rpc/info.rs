use std::net::SocketAddrV4;

use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    routing_table_size: usize,
    active_connections: usize,
    running_traversals: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP Ipv4 socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    /// Number of live contacts in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of remote addresses with outstanding or queued queries.
    pub fn active_connections(&self) -> usize {
        self.active_connections
    }
    /// Number of traversals that are not done yet, including table refreshes.
    pub fn running_traversals(&self) -> usize {
        self.running_traversals
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            active_connections: rpc.active_connections(),
            running_traversals: rpc.running_traversals(),
        }
    }
}
