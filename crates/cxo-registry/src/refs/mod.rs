//! `Refs`: an ordered sequence of element hashes stored as a Merkle tree.
//!
//! Each node stores its subtree length and the hashes of its children;
//! leaf-level nodes hold element hashes. Any change below a node changes its
//! hash and every ancestor's hash, so mutations mark the path to the root
//! dirty and then re-hash only the dirty nodes.
//!
//! A tree loads lazily: initialization reads the root only, and nodes are
//! fetched when a lookup passes through them. The load flags of the
//! [`Pack`] can ask for the whole tree, an element index, or deferred
//! hashing instead.

mod index;
mod iter;
mod mutate;
mod tree;
mod walk;

use std::fmt;

use cxo_types::Hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::config::{validate_degree, RefsFlags};
use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;

pub use iter::RefsCursor;
pub use tree::{EncodedRefs, EncodedRefsNode};

use iter::IterStack;
use tree::{NodeId, Tree, ROOT};

/// Merkle sequence of element hashes.
///
/// Only the root hash is persisted as part of an enclosing object; the
/// in-memory tree is built on first use and dropped by [`Refs::reset`].
#[derive(Clone, Default)]
pub struct Refs {
    hash: Hash,
    /// Zero until known: taken from the stored root or from the pack.
    degree: usize,
    flags: RefsFlags,
    tree: Option<Tree>,
}

impl Refs {
    /// Blank tree with an explicit degree.
    pub fn with_degree(degree: usize) -> RegistryResult<Self> {
        validate_degree(degree)?;
        Ok(Self {
            degree,
            ..Default::default()
        })
    }

    /// Uninitialized tree pointing at a stored root.
    pub fn from_hash(hash: Hash) -> Self {
        Self {
            hash,
            ..Default::default()
        }
    }

    /// Root hash. Stale while lazily deferred changes are pending.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn is_blank(&self) -> bool {
        self.hash.is_zero() && self.tree.as_ref().map_or(true, |t| t.root().length == 0)
    }

    pub fn is_initialized(&self) -> bool {
        self.tree.is_some()
    }

    /// Whether changes are waiting for [`Refs::rebuild`].
    pub fn is_dirty(&self) -> bool {
        self.tree.as_ref().is_some_and(|t| t.root().dirty)
    }

    /// Flags captured at initialization.
    pub fn flags(&self) -> RefsFlags {
        self.flags
    }

    /// Load the root (and, depending on the pack's flags, the whole tree).
    /// Does nothing if already initialized.
    pub fn init<P: Pack>(&mut self, pack: &P) -> RegistryResult<()> {
        if self.tree.is_some() {
            return Ok(());
        }
        let flags = pack.config().flags;
        if self.hash.is_zero() {
            if self.degree == 0 {
                self.degree = pack.config().degree;
            }
            validate_degree(self.degree)?;
            self.flags = flags;
            self.tree = Some(Tree::new(flags.hash_table_index, 0));
            return Ok(());
        }

        let er: EncodedRefs = pack.get_value(&self.hash)?;
        er.validate()?;
        let depth = er.depth as usize;
        let mut tree = Tree::new(flags.hash_table_index, depth);
        tree.node_mut(ROOT).length = er.length as usize;
        if depth == 0 {
            for h in &er.elements {
                tree.push_leaf(ROOT, *h);
            }
        } else {
            tree.attach_unloaded(ROOT, &er.elements);
        }
        self.degree = er.degree as usize;
        self.flags = flags;
        self.tree = Some(tree);

        if flags.loads_entire_tree() {
            if let Err(err) = self.load_subtree(pack, ROOT) {
                self.tree = None;
                return Err(err);
            }
        }
        debug!(
            refs = %self.hash.short_hex(),
            depth,
            degree = self.degree,
            length = er.length,
            "refs initialized"
        );
        Ok(())
    }

    /// Drop the in-memory tree. Deferred changes are discarded and the next
    /// access reloads from the last persisted root.
    pub fn reset(&mut self) {
        self.tree = None;
    }

    pub fn len<P: Pack>(&mut self, pack: &P) -> RegistryResult<usize> {
        self.init(pack)?;
        Ok(self.length())
    }

    pub fn is_empty<P: Pack>(&mut self, pack: &P) -> RegistryResult<bool> {
        Ok(self.len(pack)? == 0)
    }

    pub fn depth<P: Pack>(&mut self, pack: &P) -> RegistryResult<usize> {
        self.init(pack)?;
        Ok(self.tree().root().depth)
    }

    pub fn degree<P: Pack>(&mut self, pack: &P) -> RegistryResult<usize> {
        self.init(pack)?;
        Ok(self.degree)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn hash_at<P: Pack>(&mut self, pack: &P, index: usize) -> RegistryResult<Hash> {
        self.init(pack)?;
        let leaf = self.seek(pack, index)?.leaf(self.tree());
        Ok(self.tree().leaf(leaf).hash)
    }

    /// Decode the element at `index`. A nil element is
    /// [`RegistryError::ElementIsNil`].
    pub fn value_at<P: Pack, T: DeserializeOwned>(
        &mut self,
        pack: &P,
        index: usize,
    ) -> RegistryResult<T> {
        let hash = self.hash_at(pack, index)?;
        if hash.is_zero() {
            return Err(RegistryError::ElementIsNil);
        }
        pack.get_value(&hash)
    }

    pub fn has_hash<P: Pack>(&mut self, pack: &P, hash: Hash) -> RegistryResult<bool> {
        self.has_hash_in(pack, &mut IterStack::default(), hash)
    }

    /// Index of the first element carrying `hash`.
    pub fn index_of_hash<P: Pack>(
        &mut self,
        pack: &P,
        hash: Hash,
    ) -> RegistryResult<Option<usize>> {
        self.index_of_hash_in(pack, &mut IterStack::default(), hash)
    }

    /// Indices of every element carrying `hash`, ascending.
    pub fn indices_of_hash<P: Pack>(&mut self, pack: &P, hash: Hash) -> RegistryResult<Vec<usize>> {
        self.indices_of_hash_in(pack, &mut IterStack::default(), hash)
    }

    /// Decode the first element carrying `hash`. Absence is
    /// [`RegistryError::ElementNotFound`]; a present zero hash is
    /// [`RegistryError::ElementIsNil`].
    pub fn value_by_hash<P: Pack, T: DeserializeOwned>(
        &mut self,
        pack: &P,
        hash: Hash,
    ) -> RegistryResult<T> {
        self.value_by_hash_with_index(pack, hash).map(|(_, v)| v)
    }

    pub fn value_by_hash_with_index<P: Pack, T: DeserializeOwned>(
        &mut self,
        pack: &P,
        hash: Hash,
    ) -> RegistryResult<(usize, T)> {
        let index = self
            .index_of_hash(pack, hash)?
            .ok_or(RegistryError::ElementNotFound(hash))?;
        if hash.is_zero() {
            return Err(RegistryError::ElementIsNil);
        }
        Ok((index, pack.get_value(&hash)?))
    }

    fn has_hash_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        hash: Hash,
    ) -> RegistryResult<bool> {
        self.init(pack)?;
        if let Some(index) = self.tree().index.as_ref() {
            return Ok(index.contains(&hash));
        }
        Ok(self.index_of_hash_in(pack, stack, hash)?.is_some())
    }

    fn index_of_hash_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        hash: Hash,
    ) -> RegistryResult<Option<usize>> {
        self.init(pack)?;
        if self.tree().index.is_some() {
            return Ok(self.indexed_positions(hash).into_iter().min());
        }
        let mut found = None;
        self.iterate(pack, stack, 0, true, &mut |_, i, h| {
            if h == hash {
                found = Some(i);
                return Ok(std::ops::ControlFlow::Break(()));
            }
            Ok(std::ops::ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    fn indices_of_hash_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        hash: Hash,
    ) -> RegistryResult<Vec<usize>> {
        self.init(pack)?;
        if self.tree().index.is_some() {
            let mut positions = self.indexed_positions(hash);
            positions.sort_unstable();
            return Ok(positions);
        }
        let mut found = Vec::new();
        self.iterate(pack, stack, 0, true, &mut |_, i, h| {
            if h == hash {
                found.push(i);
            }
            Ok(std::ops::ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    fn indexed_positions(&self, hash: Hash) -> Vec<usize> {
        let tree = self.tree();
        tree.index
            .as_ref()
            .map(|index| {
                index
                    .leaves(&hash)
                    .iter()
                    .map(|l| tree.index_of_leaf(*l))
                    .collect()
            })
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Loading and hashing internals
    // -----------------------------------------------------------------------

    fn tree(&self) -> &Tree {
        self.tree.as_ref().expect("refs is not initialized")
    }

    fn tree_mut(&mut self) -> &mut Tree {
        self.tree.as_mut().expect("refs is not initialized")
    }

    fn length(&self) -> usize {
        self.tree().root().length
    }

    /// Load a non-root node from the store if it is not loaded yet.
    fn load_node<P: Pack>(&mut self, pack: &P, id: NodeId) -> RegistryResult<()> {
        let (loaded, hash, depth) = {
            let node = self.tree().node(id);
            (node.loaded, node.hash, node.depth)
        };
        if loaded {
            return Ok(());
        }
        let en: EncodedRefsNode = pack.get_value(&hash)?;
        en.validate(self.degree, depth)?;
        let tree = self.tree_mut();
        tree.node_mut(id).length = en.length as usize;
        if depth == 0 {
            for h in &en.elements {
                tree.push_leaf(id, *h);
            }
        } else {
            tree.attach_unloaded(id, &en.elements);
        }
        tree.node_mut(id).loaded = true;
        if self.flags.loads_entire_tree() {
            self.load_subtree(pack, id)?;
        }
        Ok(())
    }

    /// Load every descendant of a loaded node and check that lengths add up.
    /// Only used with flags that load the entire tree, so `load_node`
    /// recurses back here for each child.
    fn load_subtree<P: Pack>(&mut self, pack: &P, id: NodeId) -> RegistryResult<()> {
        let node = self.tree().node(id);
        if node.depth == 0 {
            return Ok(());
        }
        let branches = node.branches.clone();
        for b in &branches {
            self.load_node(pack, *b)?;
        }
        let tree = self.tree();
        let sum: usize = branches.iter().map(|b| tree.node(*b).length).sum();
        let declared = tree.node(id).length;
        if sum != declared {
            return Err(RegistryError::MalformedRefs(format!(
                "node declares {declared} elements, children hold {sum}"
            )));
        }
        Ok(())
    }

    /// Encoded form of a node with its current children.
    fn encode_node(&self, id: NodeId) -> RegistryResult<Vec<u8>> {
        let tree = self.tree();
        let node = tree.node(id);
        let length = u32::try_from(node.length)
            .map_err(|_| RegistryError::MalformedRefs("length exceeds u32".into()))?;
        let elements = tree.child_hashes(id);
        if id == ROOT {
            crate::codec::encode(&EncodedRefs {
                depth: node.depth as u32,
                degree: self.degree as u32,
                length,
                elements,
            })
        } else {
            crate::codec::encode(&EncodedRefsNode { length, elements })
        }
    }

    /// Persist dirty nodes bottom-up and refresh the root hash.
    fn flush<P: Pack>(&mut self, pack: &P) -> RegistryResult<()> {
        let root = self.tree().root();
        if !root.dirty {
            return Ok(());
        }
        if root.length == 0 {
            let indexed = self.flags.hash_table_index;
            self.tree = Some(Tree::new(indexed, 0));
            self.hash = Hash::ZERO;
            return Ok(());
        }
        self.flush_node(pack, ROOT)
    }

    fn flush_node<P: Pack>(&mut self, pack: &P, id: NodeId) -> RegistryResult<()> {
        let node = self.tree().node(id);
        if !node.dirty {
            return Ok(());
        }
        if node.depth > 0 {
            for b in node.branches.clone() {
                self.flush_node(pack, b)?;
            }
        }
        let hash = pack.add(self.encode_node(id)?)?;
        let node = self.tree_mut().node_mut(id);
        node.hash = hash;
        node.dirty = false;
        if id == ROOT {
            self.hash = hash;
        }
        Ok(())
    }

    /// Flush unless hashing is deferred.
    fn commit<P: Pack>(&mut self, pack: &P) -> RegistryResult<()> {
        if self.flags.lazy_updating {
            return Ok(());
        }
        self.flush(pack)
    }
}

impl Serialize for Refs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.hash.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Refs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Hash::deserialize(deserializer).map(Refs::from_hash)
    }
}

impl fmt::Debug for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Refs");
        s.field("hash", &self.hash.short_hex())
            .field("degree", &self.degree);
        if let Some(tree) = &self.tree {
            s.field("depth", &tree.root().depth)
                .field("length", &tree.root().length)
                .field("dirty", &tree.root().dirty);
        }
        s.finish()
    }
}

impl fmt::Display for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash.short_hex())
    }
}
