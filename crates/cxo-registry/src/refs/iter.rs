//! Ascending and descending iteration that tolerates mutation.
//!
//! A visitor that wants to change the tree gets a [`RefsCursor`]. Every
//! active iteration owns a frame on an [`IterStack`] that travels with the
//! cursor into mutators and nested iterations. Mutators shift the frames'
//! positions and flag them for a rewind; a flagged iteration drops its
//! node path and descends again from the root by logical index.

use std::ops::ControlFlow;

use cxo_types::Hash;
use serde::Serialize;

use super::tree::{LeafId, NodeId, Tree, ROOT};
use super::Refs;
use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;

#[derive(Debug)]
struct Frame {
    /// Index of the element most recently handed to the visitor.
    current: isize,
    ascending: bool,
    rewind: bool,
    cleared: bool,
}

/// Frames of the iterations currently running over one tree, outermost
/// first.
#[derive(Debug, Default)]
pub(crate) struct IterStack {
    frames: Vec<Frame>,
}

impl IterStack {
    /// An element at `index` was removed.
    pub(crate) fn deleted(&mut self, index: usize) {
        let index = index as isize;
        for frame in &mut self.frames {
            let shifts = if frame.ascending {
                index <= frame.current
            } else {
                index < frame.current
            };
            if shifts {
                frame.current -= 1;
            }
            frame.rewind = true;
        }
    }

    /// Nodes were added, removed or replaced without removing elements.
    pub(crate) fn reshaped(&mut self) {
        for frame in &mut self.frames {
            frame.rewind = true;
        }
    }

    pub(crate) fn cleared(&mut self) {
        for frame in &mut self.frames {
            frame.cleared = true;
            frame.rewind = true;
        }
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("refs: iteration without a frame")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("refs: iteration without a frame")
    }
}

/// Node path from the root to one element: `(node, child position)` per
/// level, ending with the leaf-level node and the leaf's position.
#[derive(Debug)]
pub(crate) struct Path {
    steps: Vec<(NodeId, usize)>,
}

impl Path {
    pub(crate) fn leaf(&self, tree: &Tree) -> LeafId {
        let (node, pos) = *self.steps.last().expect("refs: empty path");
        tree.node(node).leaves[pos]
    }
}

impl Refs {
    /// Path to the element at `index`, loading nodes on the way.
    pub(crate) fn seek<P: Pack>(&mut self, pack: &P, index: usize) -> RegistryResult<Path> {
        let length = self.length();
        if index >= length {
            return Err(RegistryError::IndexOutOfRange { index, length });
        }
        let mut steps = Vec::new();
        let mut id = ROOT;
        let mut i = index;
        loop {
            let node = self.tree().node(id);
            if node.depth == 0 {
                if i >= node.leaves.len() {
                    return Err(RegistryError::MalformedRefs(format!(
                        "leaf node holds {} elements, wanted position {i}",
                        node.leaves.len()
                    )));
                }
                steps.push((id, i));
                return Ok(Path { steps });
            }
            let count = node.branches.len();
            let mut next = None;
            for k in 0..count {
                let b = self.tree().node(id).branches[k];
                self.load_node(pack, b)?;
                let len = self.tree().node(b).length;
                if i < len {
                    next = Some((k, b));
                    break;
                }
                i -= len;
            }
            let (k, b) = next.ok_or_else(|| {
                RegistryError::MalformedRefs("index runs past the children of a node".into())
            })?;
            steps.push((id, k));
            id = b;
        }
    }

    /// Move the path to the neighbouring element. Returns `false` at the end.
    fn advance<P: Pack>(
        &mut self,
        pack: &P,
        path: &mut Path,
        ascending: bool,
    ) -> RegistryResult<bool> {
        loop {
            let Some(&(id, pos)) = path.steps.last() else {
                return Ok(false);
            };
            let count = self.tree().node(id).child_count();
            let next = if ascending {
                (pos + 1 < count).then_some(pos + 1)
            } else {
                pos.checked_sub(1)
            };
            match next {
                Some(p) => {
                    if let Some(step) = path.steps.last_mut() {
                        step.1 = p;
                    }
                    break;
                }
                None => {
                    path.steps.pop();
                }
            }
        }
        loop {
            let (id, pos) = *path.steps.last().expect("refs: empty path");
            let node = self.tree().node(id);
            if node.depth == 0 {
                return Ok(true);
            }
            let child = node.branches[pos];
            self.load_node(pack, child)?;
            let count = self.tree().node(child).child_count();
            if count == 0 {
                return Err(RegistryError::MalformedRefs("empty non-root node".into()));
            }
            path.steps.push((child, if ascending { 0 } else { count - 1 }));
        }
    }

    /// Visit elements from `from` in one direction. The visitor may mutate
    /// the tree through the cursor it receives.
    pub(crate) fn iterate<P, F>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        from: usize,
        ascending: bool,
        f: &mut F,
    ) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        self.init(pack)?;
        let length = self.length();
        if length == 0 {
            return Ok(());
        }
        if from >= length {
            return Err(RegistryError::IndexOutOfRange {
                index: from,
                length,
            });
        }
        stack.frames.push(Frame {
            current: from as isize,
            ascending,
            rewind: false,
            cleared: false,
        });
        let result = self.run_frame(pack, stack, ascending, f);
        stack.frames.pop();
        result
    }

    fn run_frame<P, F>(
        &mut self,
        pack: &P,
        stack: &mut IterStack,
        ascending: bool,
        f: &mut F,
    ) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let mut next = stack.top().current;
        'seek: loop {
            if next < 0 || next as usize >= self.length() {
                return Ok(());
            }
            let mut path = self.seek(pack, next as usize)?;
            loop {
                let hash = self.tree().leaf(path.leaf(self.tree())).hash;
                let frame = stack.top_mut();
                frame.current = next;
                frame.rewind = false;

                let flow = {
                    let mut cursor = RefsCursor {
                        refs: &mut *self,
                        pack,
                        stack: &mut *stack,
                    };
                    f(&mut cursor, next as usize, hash)?
                };
                if flow.is_break() {
                    return Ok(());
                }

                let frame = stack.top();
                if frame.cleared {
                    return Ok(());
                }
                next = if ascending {
                    frame.current + 1
                } else {
                    frame.current - 1
                };
                if frame.rewind {
                    continue 'seek;
                }
                if !self.advance(pack, &mut path, ascending)? {
                    return Ok(());
                }
            }
        }
    }

    pub fn ascend<P, F>(&mut self, pack: &P, f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        self.ascend_from(pack, 0, f)
    }

    /// Visit elements from `from` up to the last one.
    pub fn ascend_from<P, F>(&mut self, pack: &P, from: usize, mut f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let mut stack = IterStack::default();
        self.iterate(pack, &mut stack, from, true, &mut |_, i, h| f(i, h))
    }

    pub fn descend<P, F>(&mut self, pack: &P, f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let length = self.len(pack)?;
        if length == 0 {
            return Ok(());
        }
        self.descend_from(pack, length - 1, f)
    }

    /// Visit elements from `from` down to the first one.
    pub fn descend_from<P, F>(&mut self, pack: &P, from: usize, mut f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let mut stack = IterStack::default();
        self.iterate(pack, &mut stack, from, false, &mut |_, i, h| f(i, h))
    }

    /// Ascend with a visitor that may mutate the tree.
    pub fn ascend_mut<P, F>(&mut self, pack: &P, mut f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let mut stack = IterStack::default();
        self.iterate(pack, &mut stack, 0, true, &mut f)
    }

    /// Descend with a visitor that may mutate the tree.
    pub fn descend_mut<P, F>(&mut self, pack: &P, mut f: F) -> RegistryResult<()>
    where
        P: Pack,
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let length = self.len(pack)?;
        if length == 0 {
            return Ok(());
        }
        let mut stack = IterStack::default();
        self.iterate(pack, &mut stack, length - 1, false, &mut f)
    }
}

/// Handle on a `Refs` given to mutating visitors.
///
/// Changes made through the cursor keep every running iteration over the
/// tree consistent. Rebuilding or resetting the tree is refused while it
/// is being iterated.
pub struct RefsCursor<'a, P> {
    refs: &'a mut Refs,
    pack: &'a P,
    stack: &'a mut IterStack,
}

impl<'a, P: Pack> RefsCursor<'a, P> {
    pub fn len(&self) -> usize {
        self.refs.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Root hash as of the last flush.
    pub fn hash(&self) -> Hash {
        self.refs.hash
    }

    pub fn hash_at(&mut self, index: usize) -> RegistryResult<Hash> {
        self.refs.hash_at(self.pack, index)
    }

    pub fn has_hash(&mut self, hash: Hash) -> RegistryResult<bool> {
        self.refs.has_hash_in(self.pack, &mut *self.stack, hash)
    }

    pub fn index_of_hash(&mut self, hash: Hash) -> RegistryResult<Option<usize>> {
        self.refs.index_of_hash_in(self.pack, &mut *self.stack, hash)
    }

    pub fn indices_of_hash(&mut self, hash: Hash) -> RegistryResult<Vec<usize>> {
        self.refs.indices_of_hash_in(self.pack, &mut *self.stack, hash)
    }

    pub fn set_hash_at(&mut self, index: usize, hash: Hash) -> RegistryResult<()> {
        self.refs.set_hash_at(self.pack, index, hash)
    }

    pub fn append_hashes(&mut self, hashes: &[Hash]) -> RegistryResult<()> {
        self.refs.append_hashes_in(self.pack, &mut *self.stack, hashes)
    }

    pub fn append_values<T: Serialize>(&mut self, values: &[Option<T>]) -> RegistryResult<()> {
        let hashes = super::mutate::store_values(self.pack, values)?;
        self.append_hashes(&hashes)
    }

    pub fn delete_at(&mut self, index: usize) -> RegistryResult<()> {
        self.refs.delete_at_in(self.pack, &mut *self.stack, index)
    }

    pub fn delete_by_hash(&mut self, hash: Hash) -> RegistryResult<usize> {
        self.refs.delete_by_hash_in(self.pack, &mut *self.stack, hash)
    }

    /// Remove every element. Running iterations end after the current
    /// visitor call returns.
    pub fn clear(&mut self) {
        self.refs.clear();
        self.stack.cleared();
    }

    /// Nested ascending iteration.
    pub fn ascend<F>(&mut self, mut f: F) -> RegistryResult<()>
    where
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        self.refs.iterate(self.pack, &mut *self.stack, 0, true, &mut f)
    }

    /// Nested descending iteration.
    pub fn descend<F>(&mut self, mut f: F) -> RegistryResult<()>
    where
        F: FnMut(&mut RefsCursor<'_, P>, usize, Hash) -> RegistryResult<ControlFlow<()>>,
    {
        let length = self.len();
        if length == 0 {
            return Ok(());
        }
        self.refs
            .iterate(self.pack, &mut *self.stack, length - 1, false, &mut f)
    }

    pub fn rebuild(&mut self) -> RegistryResult<()> {
        Err(RegistryError::RefsIterating)
    }

    pub fn reset(&mut self) -> RegistryResult<()> {
        Err(RegistryError::RefsIterating)
    }
}
