//! In-memory arena of a `Refs` tree and its stored encodings.
//!
//! Nodes and leaves live in vectors owned by the tree and refer to each
//! other by index. Node 0 is always the root.

use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use super::index::HashIndex;
use crate::config::validate_degree;
use crate::error::{RegistryError, RegistryResult};

/// Stored encoding of a root node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRefs {
    pub depth: u32,
    pub degree: u32,
    pub length: u32,
    /// Branch hashes if `depth > 0`, element hashes otherwise.
    pub elements: Vec<Hash>,
}

/// Stored encoding of a non-root node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRefsNode {
    pub length: u32,
    pub elements: Vec<Hash>,
}

fn malformed(msg: impl Into<String>) -> RegistryError {
    RegistryError::MalformedRefs(msg.into())
}

/// Elements a subtree of the given depth can hold.
pub(crate) fn capacity(degree: usize, depth: usize) -> usize {
    let exp = u32::try_from(depth.saturating_add(1)).unwrap_or(u32::MAX);
    degree.saturating_pow(exp)
}

/// Smallest depth whose capacity holds `length` elements.
pub(crate) fn depth_to_fit(degree: usize, length: usize) -> usize {
    let mut depth = 0;
    while capacity(degree, depth) < length {
        depth += 1;
    }
    depth
}

fn check_children(
    elements: &[Hash],
    length: usize,
    degree: usize,
    depth: usize,
) -> RegistryResult<()> {
    if elements.is_empty() || elements.len() > degree {
        return Err(malformed(format!(
            "node holds {} children, degree is {degree}",
            elements.len()
        )));
    }
    if depth == 0 {
        if elements.len() != length {
            return Err(malformed(format!(
                "leaf node declares {length} elements, holds {}",
                elements.len()
            )));
        }
        return Ok(());
    }
    if elements.iter().any(Hash::is_zero) {
        return Err(malformed("blank branch hash"));
    }
    if length < elements.len() || length > capacity(degree, depth) {
        return Err(malformed(format!(
            "length {length} does not fit {} branches at depth {depth}",
            elements.len()
        )));
    }
    Ok(())
}

impl EncodedRefs {
    pub fn validate(&self) -> RegistryResult<()> {
        let degree = self.degree as usize;
        validate_degree(degree).map_err(|e| malformed(e.to_string()))?;
        if self.length == 0 {
            return Err(malformed("stored root of an empty refs"));
        }
        check_children(&self.elements, self.length as usize, degree, self.depth as usize)
    }
}

impl EncodedRefsNode {
    pub fn validate(&self, degree: usize, depth: usize) -> RegistryResult<()> {
        check_children(&self.elements, self.length as usize, degree, depth)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct LeafId(pub(crate) usize);

pub(crate) const ROOT: NodeId = NodeId(0);

#[derive(Clone, Debug)]
pub(crate) struct Node {
    /// Stored hash; stale while `dirty`. Unused for the root.
    pub(crate) hash: Hash,
    /// Elements in this subtree. Meaningful once `loaded`.
    pub(crate) length: usize,
    pub(crate) depth: usize,
    pub(crate) branches: Vec<NodeId>,
    pub(crate) leaves: Vec<LeafId>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) loaded: bool,
    pub(crate) dirty: bool,
}

impl Node {
    fn empty(parent: Option<NodeId>, depth: usize) -> Self {
        Self {
            hash: Hash::ZERO,
            length: 0,
            depth,
            branches: Vec::new(),
            leaves: Vec::new(),
            parent,
            loaded: true,
            dirty: false,
        }
    }

    fn unloaded(hash: Hash, parent: NodeId, depth: usize) -> Self {
        Self {
            hash,
            loaded: false,
            ..Self::empty(Some(parent), depth)
        }
    }

    /// Number of direct children.
    pub(crate) fn child_count(&self) -> usize {
        if self.depth == 0 {
            self.leaves.len()
        } else {
            self.branches.len()
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Leaf {
    pub(crate) hash: Hash,
    pub(crate) parent: NodeId,
}

#[derive(Clone, Debug)]
pub(crate) struct Tree {
    nodes: Vec<Option<Node>>,
    free_nodes: Vec<NodeId>,
    leaves: Vec<Option<Leaf>>,
    free_leaves: Vec<LeafId>,
    pub(crate) index: Option<HashIndex>,
}

impl Tree {
    /// A loaded, empty tree whose root sits at `depth`.
    pub(crate) fn new(indexed: bool, depth: usize) -> Self {
        Self {
            nodes: vec![Some(Node::empty(None, depth))],
            free_nodes: Vec::new(),
            leaves: Vec::new(),
            free_leaves: Vec::new(),
            index: indexed.then(HashIndex::default),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("refs: dangling node id")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("refs: dangling node id")
    }

    pub(crate) fn leaf(&self, id: LeafId) -> &Leaf {
        self.leaves[id.0].as_ref().expect("refs: dangling leaf id")
    }

    pub(crate) fn root(&self) -> &Node {
        self.node(ROOT)
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Append a fresh, loaded, dirty child below `parent`.
    pub(crate) fn push_branch(&mut self, parent: NodeId) -> NodeId {
        let depth = self.node(parent).depth - 1;
        let mut node = Node::empty(Some(parent), depth);
        node.dirty = true;
        let id = self.alloc_node(node);
        self.node_mut(parent).branches.push(id);
        id
    }

    /// Attach not-yet-loaded children to a node being loaded.
    pub(crate) fn attach_unloaded(&mut self, parent: NodeId, hashes: &[Hash]) {
        let depth = self.node(parent).depth - 1;
        for hash in hashes {
            let id = self.alloc_node(Node::unloaded(*hash, parent, depth));
            self.node_mut(parent).branches.push(id);
        }
    }

    /// Append an element to a leaf-level node. Lengths are not touched.
    pub(crate) fn push_leaf(&mut self, parent: NodeId, hash: Hash) -> LeafId {
        let leaf = Leaf { hash, parent };
        let id = match self.free_leaves.pop() {
            Some(id) => {
                self.leaves[id.0] = Some(leaf);
                id
            }
            None => {
                self.leaves.push(Some(leaf));
                LeafId(self.leaves.len() - 1)
            }
        };
        self.node_mut(parent).leaves.push(id);
        if let Some(index) = self.index.as_mut() {
            index.insert(hash, id);
        }
        id
    }

    /// Detach and free a leaf, returning the node that held it.
    pub(crate) fn remove_leaf(&mut self, id: LeafId) -> NodeId {
        let leaf = self.leaves[id.0].take().expect("refs: dangling leaf id");
        self.free_leaves.push(id);
        self.node_mut(leaf.parent).leaves.retain(|l| *l != id);
        if let Some(index) = self.index.as_mut() {
            index.remove(&leaf.hash, id);
        }
        leaf.parent
    }

    /// Swap the hash of a leaf, returning the node that holds it.
    pub(crate) fn replace_leaf(&mut self, id: LeafId, hash: Hash) -> NodeId {
        let leaf = self.leaves[id.0].as_mut().expect("refs: dangling leaf id");
        let old = std::mem::replace(&mut leaf.hash, hash);
        let parent = leaf.parent;
        if let Some(index) = self.index.as_mut() {
            index.remove(&old, id);
            index.insert(hash, id);
        }
        parent
    }

    /// Add `delta` to the length of `from` and every ancestor, marking them
    /// dirty.
    pub(crate) fn bump(&mut self, from: NodeId, delta: isize) {
        let mut id = from;
        loop {
            let node = self.node_mut(id);
            node.length = node.length.saturating_add_signed(delta);
            node.dirty = true;
            match node.parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
    }

    /// Free empty non-root nodes on the way up from `from`.
    pub(crate) fn prune(&mut self, from: NodeId) {
        let mut id = from;
        while id != ROOT {
            let node = self.node(id);
            if node.length != 0 || node.child_count() != 0 {
                break;
            }
            let parent = node.parent.expect("refs: non-root node without parent");
            self.node_mut(parent).branches.retain(|b| *b != id);
            self.nodes[id.0] = None;
            self.free_nodes.push(id);
            id = parent;
        }
    }

    /// Position of `child` among the branches of `parent` and the number of
    /// elements before it.
    pub(crate) fn offset_in_parent(&self, parent: NodeId, child: NodeId) -> usize {
        self.node(parent)
            .branches
            .iter()
            .take_while(|b| **b != child)
            .map(|b| self.node(*b).length)
            .sum()
    }

    /// Logical index of a leaf. Requires every node left of the leaf's path
    /// to be loaded.
    pub(crate) fn index_of_leaf(&self, id: LeafId) -> usize {
        let leaf = self.leaf(id);
        let mut node = leaf.parent;
        let mut index = self
            .node(node)
            .leaves
            .iter()
            .position(|l| *l == id)
            .expect("refs: leaf not held by its parent");
        while let Some(parent) = self.node(node).parent {
            index += self.offset_in_parent(parent, node);
            node = parent;
        }
        index
    }

    /// Hashes of the direct children of a node, for encoding.
    pub(crate) fn child_hashes(&self, id: NodeId) -> Vec<Hash> {
        let node = self.node(id);
        if node.depth == 0 {
            node.leaves.iter().map(|l| self.leaf(*l).hash).collect()
        } else {
            node.branches.iter().map(|b| self.node(*b).hash).collect()
        }
    }

    pub(crate) fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}
