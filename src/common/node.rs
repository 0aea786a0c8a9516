//! Contacts and nodes of the DHT network.
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// A remote node with a known [Id], as stored in the routing table
/// and encoded in `nodes` fields.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    #[cfg(test)]
    pub(crate) fn random() -> Node {
        use rand::Rng;

        let mut rng = rand::thread_rng();

        Node {
            id: Id::random(),
            address: SocketAddrV4::new(rng.gen::<[u8; 4]>().into(), rng.gen_range(1..u16::MAX)),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// An address that may or may not have a known [Id] yet.
///
/// The address is the identity of a contact, the id is advisory until
/// the remote node responds with it.
pub struct Contact {
    pub address: SocketAddrV4,
    pub id: Option<Id>,
}

impl Contact {
    pub fn new(address: SocketAddrV4) -> Self {
        Contact { address, id: None }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }
}

impl From<Node> for Contact {
    fn from(node: Node) -> Self {
        Contact {
            address: node.address,
            id: Some(node.id),
        }
    }
}

impl From<SocketAddrV4> for Contact {
    fn from(address: SocketAddrV4) -> Self {
        Contact::new(address)
    }
}
