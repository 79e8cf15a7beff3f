use std::fmt::Write;
use std::ops::ControlFlow;

use cxo_types::Hash;

use super::tree::{NodeId, ROOT};
use super::Refs;
use crate::error::{RegistryError, RegistryResult};
use crate::pack::Pack;
use crate::schema::Schema;
use crate::walk::{self, WalkFn, WalkStep};

impl Refs {
    /// Visit the root (at `depth + 1`), every branch node (at the depth of
    /// the node holding it) and every element (at 0). Elements are not
    /// followed. A tree that was not initialized before the walk is reset
    /// afterwards.
    pub fn walk<P: Pack>(&mut self, pack: &P, f: &mut WalkFn<'_>) -> RegistryResult<()> {
        self.walk_from(pack, None, f).map(|_| ())
    }

    /// Like [`Refs::walk`], also descending into elements of schema `elem`
    /// when the visitor asks for it.
    pub fn walk_elements<P: Pack>(
        &mut self,
        pack: &P,
        elem: &Schema,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<()> {
        self.walk_from(pack, Some(elem), f).map(|_| ())
    }

    pub(crate) fn walk_from<P: Pack>(
        &mut self,
        pack: &P,
        elem: Option<&Schema>,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<ControlFlow<()>> {
        if self.is_dirty() {
            return Err(RegistryError::RefsDirty);
        }
        if self.hash.is_zero() {
            return Ok(match f(Hash::ZERO, 1)? {
                WalkStep::Stop => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            });
        }
        let was_initialized = self.is_initialized();
        self.init(pack)?;
        let result = self.walk_root(pack, elem, f);
        if !was_initialized {
            self.reset();
        }
        result
    }

    fn walk_root<P: Pack>(
        &mut self,
        pack: &P,
        elem: Option<&Schema>,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<ControlFlow<()>> {
        match f(self.hash, self.tree().root().depth + 1)? {
            WalkStep::Stop => Ok(ControlFlow::Break(())),
            WalkStep::Skip => Ok(ControlFlow::Continue(())),
            WalkStep::Deeper => self.walk_node(pack, ROOT, elem, f),
        }
    }

    fn walk_node<P: Pack>(
        &mut self,
        pack: &P,
        id: NodeId,
        elem: Option<&Schema>,
        f: &mut WalkFn<'_>,
    ) -> RegistryResult<ControlFlow<()>> {
        let node = self.tree().node(id);
        let depth = node.depth;
        if depth == 0 {
            let tree = self.tree();
            let hashes: Vec<Hash> = node.leaves.iter().map(|l| tree.leaf(*l).hash).collect();
            for h in hashes {
                match f(h, 0)? {
                    WalkStep::Stop => return Ok(ControlFlow::Break(())),
                    WalkStep::Skip => {}
                    WalkStep::Deeper => {
                        if let Some(elem) = elem {
                            if walk::walk_hash(pack, elem, h, f)?.is_break() {
                                return Ok(ControlFlow::Break(()));
                            }
                        }
                    }
                }
            }
            return Ok(ControlFlow::Continue(()));
        }
        for b in node.branches.clone() {
            let hash = self.tree().node(b).hash;
            match f(hash, depth)? {
                WalkStep::Stop => return Ok(ControlFlow::Break(())),
                WalkStep::Skip => {}
                WalkStep::Deeper => {
                    self.load_node(pack, b)?;
                    if self.walk_node(pack, b, elem, f)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Render the tree for inspection, loading all of it.
    pub fn debug_tree<P: Pack>(&mut self, pack: &P) -> RegistryResult<String> {
        self.init(pack)?;
        let mut out = String::new();
        let root = self.tree().root();
        let _ = writeln!(
            out,
            "refs {} (degree {}, depth {}, length {}{})",
            self.hash.short_hex(),
            self.degree,
            root.depth,
            root.length,
            if root.dirty { ", dirty" } else { "" }
        );
        self.render_node(pack, ROOT, 1, &mut out)?;
        Ok(out)
    }

    fn render_node<P: Pack>(
        &mut self,
        pack: &P,
        id: NodeId,
        indent: usize,
        out: &mut String,
    ) -> RegistryResult<()> {
        let node = self.tree().node(id);
        let pad = "  ".repeat(indent);
        if node.depth == 0 {
            let tree = self.tree();
            for l in &node.leaves {
                let h = tree.leaf(*l).hash;
                let label = if h.is_zero() { "nil".to_string() } else { h.short_hex() };
                let _ = writeln!(out, "{pad}{label}");
            }
            return Ok(());
        }
        for b in node.branches.clone() {
            self.load_node(pack, b)?;
            let child = self.tree().node(b);
            let _ = writeln!(
                out,
                "{pad}{} ({}{})",
                child.hash.short_hex(),
                child.length,
                if child.dirty { ", dirty" } else { "" }
            );
            self.render_node(pack, b, indent + 1, out)?;
        }
        Ok(())
    }
}
