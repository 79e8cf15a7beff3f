use std::collections::HashMap;

use cxo_types::Hash;

use super::tree::LeafId;

/// Element hash -> leaves currently holding it.
///
/// Zero hashes are indexed too, so callers asking about nil elements must
/// check for them explicitly.
#[derive(Clone, Debug, Default)]
pub(crate) struct HashIndex {
    map: HashMap<Hash, Vec<LeafId>>,
}

impl HashIndex {
    pub(crate) fn insert(&mut self, hash: Hash, leaf: LeafId) {
        self.map.entry(hash).or_default().push(leaf);
    }

    pub(crate) fn remove(&mut self, hash: &Hash, leaf: LeafId) {
        if let Some(leaves) = self.map.get_mut(hash) {
            leaves.retain(|l| *l != leaf);
            if leaves.is_empty() {
                self.map.remove(hash);
            }
        }
    }

    pub(crate) fn leaves(&self, hash: &Hash) -> &[LeafId] {
        self.map.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.map.contains_key(hash)
    }

    /// Number of leaves indexed.
    pub(crate) fn leaf_count(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}
