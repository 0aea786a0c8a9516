use std::cmp::Ordering;

use crate::common::{Id, Node, MAX_BUCKET_SIZE_K};

#[derive(Debug, Clone, PartialEq)]
/// A node that responded to a traversal, and the announce token it gave us if any.
pub struct RespondingNode {
    pub node: Node,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
/// The [MAX_BUCKET_SIZE_K] closest responding nodes to a target, sorted by distance.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<RespondingNode>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K + 1),
        }
    }

    // === Getters ===

    pub fn nodes(&self) -> &[RespondingNode] {
        &self.nodes
    }

    // === Public Methods ===

    /// Insert a node, replacing the token of an existing entry with the same id.
    pub fn add(&mut self, node: Node, token: Option<Vec<u8>>) {
        let target = self.target;

        match self.nodes.binary_search_by(|entry| {
            if entry.node.id == node.id {
                Ordering::Equal
            } else {
                match target.cmp_distance(&entry.node.id, &node.id) {
                    // Ties are ordered by insertion.
                    Ordering::Equal => Ordering::Less,
                    other => other,
                }
            }
        }) {
            Ok(pos) => self.nodes[pos] = RespondingNode { node, token },
            Err(pos) => {
                if pos < MAX_BUCKET_SIZE_K {
                    self.nodes.insert(pos, RespondingNode { node, token });
                    self.nodes.truncate(MAX_BUCKET_SIZE_K);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
