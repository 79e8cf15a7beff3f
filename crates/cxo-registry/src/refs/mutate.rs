use std::ops::ControlFlow;

use cxo_types::Hash;
use serde::Serialize;
use tracing::{debug, trace};

use super::iter::IterStack;
use super::tree::{capacity, depth_to_fit, LeafId, NodeId, Tree, ROOT};
use super::Refs;
use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;

/// Store each value and return its hash; `None` becomes the zero hash.
pub(crate) fn store_values<P: Pack, T: Serialize>(
    pack: &P,
    values: &[Option<T>],
) -> RegistryResult<Vec<Hash>> {
    values
        .iter()
        .map(|v| match v {
            Some(v) => pack.add_value(v),
            None => Ok(Hash::ZERO),
        })
        .collect()
}

impl Refs {
    pub fn append_hashes<P: Pack>(&mut self, pack: &P, hashes: &[Hash]) -> RegistryResult<()> {
        self.append_hashes_in(pack, &mut IterStack::default(), hashes)
    }

    /// Store the values and append their hashes.
    pub fn append_values<P: Pack, T: Serialize>(
        &mut self,
        pack: &P,
        values: &[Option<T>],
    ) -> RegistryResult<()> {
        let hashes = store_values(pack, values)?;
        self.append_hashes(pack, &hashes)
    }

    /// Append every element of `other`, in order.
    pub fn append_refs<P: Pack>(&mut self, pack: &P, other: &mut Refs) -> RegistryResult<()> {
        let mut hashes = Vec::with_capacity(other.len(pack)?);
        other.ascend(pack, |_, h| {
            hashes.push(h);
            Ok(ControlFlow::Continue(()))
        })?;
        self.append_hashes(pack, &hashes)
    }

    pub fn set_hash_at<P: Pack>(
        &mut self,
        pack: &P,
        index: usize,
        hash: Hash,
    ) -> RegistryResult<()> {
        self.init(pack)?;
        let leaf = self.seek(pack, index)?.leaf(self.tree());
        if self.tree().leaf(leaf).hash == hash {
            return Ok(());
        }
        let tree = self.tree_mut();
        let parent = tree.replace_leaf(leaf, hash);
        tree.bump(parent, 0);
        self.commit(pack)
    }

    pub fn set_value_at<P: Pack, T: Serialize>(
        &mut self,
        pack: &P,
        index: usize,
        value: Option<&T>,
    ) -> RegistryResult<()> {
        let hash = match value {
            Some(v) => pack.add_value(v)?,
            None => Hash::ZERO,
        };
        self.set_hash_at(pack, index, hash)
    }

    pub fn delete_at<P: Pack>(&mut self, pack: &P, index: usize) -> RegistryResult<()> {
        self.delete_at_in(pack, &mut IterStack::default(), index)
    }

    /// Delete every element carrying `hash` and return how many went.
    pub fn delete_by_hash<P: Pack>(&mut self, pack: &P, hash: Hash) -> RegistryResult<usize> {
        self.delete_by_hash_in(pack, &mut IterStack::default(), hash)
    }

    /// New tree holding elements `[start, end)`, with the same degree and
    /// flags and the smallest depth that fits.
    pub fn slice<P: Pack>(&mut self, pack: &P, start: usize, end: usize) -> RegistryResult<Refs> {
        if start > end {
            return Err(RegistryError::InvalidSliceRange { start, end });
        }
        let length = self.len(pack)?;
        if end > length {
            return Err(RegistryError::IndexOutOfRange { index: end, length });
        }
        let mut hashes = Vec::with_capacity(end - start);
        if start < end {
            self.ascend_from(pack, start, |i, h| {
                if i >= end {
                    return Ok(ControlFlow::Break(()));
                }
                hashes.push(h);
                Ok(ControlFlow::Continue(()))
            })?;
        }
        let mut out = Refs {
            hash: Hash::ZERO,
            degree: self.degree,
            flags: self.flags,
            tree: None,
        };
        out.build(pack, &hashes)?;
        out.commit(pack)?;
        Ok(out)
    }

    /// Remove every element. The tree stays initialized if it was.
    pub fn clear(&mut self) {
        self.hash = Hash::ZERO;
        if self.tree.is_some() {
            self.tree = Some(Tree::new(self.flags.hash_table_index, 0));
        }
    }

    /// Bring the tree to its canonical shape and persist every pending
    /// change: the depth is reduced to the smallest that fits and deferred
    /// hashes are computed.
    pub fn rebuild<P: Pack>(&mut self, pack: &P) -> RegistryResult<()> {
        self.init(pack)?;
        self.compact(pack)?;
        self.flush(pack)
    }

    // -----------------------------------------------------------------------
    // Internals shared with the cursor
    // -----------------------------------------------------------------------

    pub(crate) fn append_hashes_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        hashes: &[Hash],
    ) -> RegistryResult<()> {
        self.init(pack)?;
        if hashes.is_empty() {
            return Ok(());
        }
        if self.tail_free(pack)? >= hashes.len() {
            for h in hashes {
                self.tail_append(pack, *h)?;
            }
            trace!(added = hashes.len(), length = self.length(), "refs tail append");
        } else {
            let mut all = self.collect_hashes(pack)?;
            all.extend_from_slice(hashes);
            self.build(pack, &all)?;
        }
        stack.reshaped();
        self.commit(pack)
    }

    pub(crate) fn delete_at_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        index: usize,
    ) -> RegistryResult<()> {
        self.init(pack)?;
        let leaf = self.seek(pack, index)?.leaf(self.tree());
        self.delete_leaf(leaf);
        stack.deleted(index);
        self.shrink(pack, stack)?;
        self.commit(pack)
    }

    pub(crate) fn delete_by_hash_in<P: Pack>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        hash: Hash,
    ) -> RegistryResult<usize> {
        self.init(pack)?;
        let mut targets: Vec<(usize, Option<LeafId>)> = match self.tree().index.as_ref() {
            Some(index) => {
                let tree = self.tree();
                index
                    .leaves(&hash)
                    .iter()
                    .map(|l| (tree.index_of_leaf(*l), Some(*l)))
                    .collect()
            }
            None => self
                .indices_of_hash_in(pack, stack, hash)?
                .into_iter()
                .map(|i| (i, None))
                .collect(),
        };
        if targets.is_empty() {
            return Ok(0);
        }
        // highest index first keeps the remaining indices valid
        targets.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (index, leaf) in &targets {
            let leaf = match leaf {
                Some(leaf) => *leaf,
                None => self.seek(pack, *index)?.leaf(self.tree()),
            };
            self.delete_leaf(leaf);
            stack.deleted(*index);
        }
        self.shrink(pack, stack)?;
        self.commit(pack)?;
        Ok(targets.len())
    }

    // -----------------------------------------------------------------------
    // Tree shape
    // -----------------------------------------------------------------------

    /// Elements that fit on the right edge without growing the tree.
    fn tail_free<P: Pack>(&mut self, pack: &P) -> RegistryResult<usize> {
        let degree = self.degree;
        let mut free = 0usize;
        let mut id = ROOT;
        loop {
            let node = self.tree().node(id);
            if node.depth == 0 {
                return Ok(free.saturating_add(degree.saturating_sub(node.leaves.len())));
            }
            let room = degree.saturating_sub(node.branches.len());
            free = free.saturating_add(room.saturating_mul(capacity(degree, node.depth - 1)));
            match node.branches.last().copied() {
                Some(last) => {
                    self.load_node(pack, last)?;
                    id = last;
                }
                None => return Ok(free),
            }
        }
    }

    /// Put one element after the last one, creating nodes along the right
    /// edge as needed.
    fn tail_append<P: Pack>(&mut self, pack: &P, hash: Hash) -> RegistryResult<()> {
        let degree = self.degree;
        let mut id = ROOT;
        loop {
            let node = self.tree().node(id);
            if node.depth == 0 {
                break;
            }
            match node.branches.last().copied() {
                Some(last) => {
                    self.load_node(pack, last)?;
                    id = last;
                }
                None => break,
            }
        }
        loop {
            let node = self.tree().node(id);
            if node.child_count() < degree {
                break;
            }
            id = node
                .parent
                .ok_or_else(|| RegistryError::MalformedRefs("no room on the right edge".into()))?;
        }
        let tree = self.tree_mut();
        while tree.node(id).depth > 0 {
            id = tree.push_branch(id);
        }
        tree.push_leaf(id, hash);
        tree.bump(id, 1);
        Ok(())
    }

    /// Replace the tree with a packed one of minimal depth holding `hashes`.
    /// Every node of the new tree is dirty.
    fn build<P: Pack>(&mut self, pack: &P, hashes: &[Hash]) -> RegistryResult<()> {
        let depth = depth_to_fit(self.degree, hashes.len());
        let previous = self.tree.as_ref().map(|t| t.root().depth);
        let mut tree = Tree::new(self.flags.hash_table_index, depth);
        tree.node_mut(ROOT).dirty = true;
        self.tree = Some(tree);
        for h in hashes {
            self.tail_append(pack, *h)?;
        }
        if previous != Some(depth) {
            debug!(
                refs = %self.hash.short_hex(),
                from = ?previous,
                to = depth,
                length = hashes.len(),
                "refs depth changed"
            );
        }
        Ok(())
    }

    /// Every element hash in order, loading the whole tree.
    fn collect_hashes<P: Pack>(&mut self, pack: &P) -> RegistryResult<Vec<Hash>> {
        let mut out = Vec::with_capacity(self.length());
        self.collect_from(pack, ROOT, &mut out)?;
        Ok(out)
    }

    fn collect_from<P: Pack>(
        &mut self,
        pack: &P,
        id: NodeId,
        out: &mut Vec<Hash>,
    ) -> RegistryResult<()> {
        let node = self.tree().node(id);
        if node.depth == 0 {
            let tree = self.tree();
            out.extend(node.leaves.iter().map(|l| tree.leaf(*l).hash));
            return Ok(());
        }
        for b in node.branches.clone() {
            self.load_node(pack, b)?;
            self.collect_from(pack, b, out)?;
        }
        Ok(())
    }

    fn delete_leaf(&mut self, leaf: LeafId) {
        let tree = self.tree_mut();
        let parent = tree.remove_leaf(leaf);
        tree.bump(parent, -1);
        tree.prune(parent);
    }

    /// After deletions: rebuild at a smaller depth if one fits, unless
    /// hashing is deferred.
    fn shrink<P: Pack>(&mut self, pack: &P, stack: &mut IterStack) -> RegistryResult<()> {
        if self.flags.lazy_updating {
            return Ok(());
        }
        if self.compact(pack)? {
            stack.reshaped();
        }
        Ok(())
    }

    /// Rebuild at the minimal depth as soon as one is smaller than the
    /// current depth. A delete that crosses a `degree^k` boundary therefore
    /// hashes like a fresh build of what is left.
    fn compact<P: Pack>(&mut self, pack: &P) -> RegistryResult<bool> {
        let length = self.length();
        if length == 0 || self.tree().root().depth <= depth_to_fit(self.degree, length) {
            return Ok(false);
        }
        let hashes = self.collect_hashes(pack)?;
        self.build(pack, &hashes)?;
        Ok(true)
    }
}
