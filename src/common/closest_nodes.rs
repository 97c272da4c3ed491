use std::vec::IntoIter;

use crate::common::{Id, Node};

#[derive(Debug, Clone)]
/// Nodes sorted by ascending XOR distance to a target, without duplicate ids.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(32),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_ok()
    }

    // === Public Methods ===

    /// Insert a node in its sorted position, returns `false` if its id is already present.
    ///
    /// XOR with a fixed target is a bijection, so equal distances mean equal ids.
    pub fn add(&mut self, node: Node) -> bool {
        match self.position(node.id()) {
            Ok(_) => false,
            Err(pos) => {
                self.nodes.insert(pos, node);
                true
            }
        }
    }

    /// Returns the closest `n` nodes.
    pub fn take(&self, n: usize) -> &[Node] {
        &self.nodes[..n.min(self.nodes.len())]
    }

    pub fn truncate(&mut self, n: usize) {
        self.nodes.truncate(n)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Result<usize, usize> {
        let seek = id.xor(&self.target);

        self.nodes
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl Extend<Node> for ClosestNodes {
    fn extend<T: IntoIterator<Item = Node>>(&mut self, iter: T) {
        for node in iter {
            self.add(node);
        }
    }
}
